use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ExecuteError;
use crate::runtime::AnyValue;

/// Outcome delivered to a waiter: the decoded typed output slot or the
/// failure that ended the request.
pub(crate) enum Delivered {
    Value(AnyValue),
    Failure(ExecuteError),
}

type Decode = Box<dyn Fn(Value) -> Result<AnyValue, serde_json::Error> + Send>;

/// Rendezvous for one in-flight request: the delivery channel plus the
/// decoder that fills the typed output slot from the wire payload.
pub(crate) struct Waiter {
    tx: oneshot::Sender<Delivered>,
    decode: Decode,
}

impl Waiter {
    pub fn new<OUT>(tx: oneshot::Sender<Delivered>) -> Self
    where
        OUT: DeserializeOwned + Send + 'static,
    {
        Self {
            tx,
            decode: Box::new(|value| {
                serde_json::from_value::<OUT>(value).map(|out| Box::new(out) as AnyValue)
            }),
        }
    }

    /// Decode the response payload into the typed slot and deliver it.
    pub fn resolve(self, data: Option<Value>) {
        let delivered = match (self.decode)(data.unwrap_or(Value::Null)) {
            Ok(value) => Delivered::Value(value),
            Err(err) => Delivered::Failure(ExecuteError::Codec(err)),
        };
        let _ = self.tx.send(delivered);
    }

    /// Deliver the failure that ended this request.
    pub fn fail(self, err: ExecuteError) {
        let _ = self.tx.send(Delivered::Failure(err));
    }
}

/// Process-wide mapping of in-flight request IDs to their waiters. Guarded
/// by the manager mutex together with the per-session ID sets, so failing
/// all waiters of one connection stays proportional to that connection's
/// in-flight count.
#[derive(Default)]
pub(crate) struct CorrelationRegistry {
    inflight: HashMap<String, Waiter>,
}

impl CorrelationRegistry {
    pub fn insert(&mut self, msg_id: String, waiter: Waiter) {
        self.inflight.insert(msg_id, waiter);
    }

    pub fn remove(&mut self, msg_id: &str) -> Option<Waiter> {
        self.inflight.remove(msg_id)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
