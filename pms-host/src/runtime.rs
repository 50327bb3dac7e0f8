use std::any::Any;
use std::sync::Arc;

use pms_sdk::protocol::ExtensionConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecuteError;
use crate::session::Session;

/// Type-erased value passed between the execution engine and local
/// handlers.
pub(crate) type AnyValue = Box<dyn Any + Send>;

type Invoke = Arc<dyn Fn(AnyValue) -> anyhow::Result<AnyValue> + Send + Sync>;
type DecodeInput = Arc<dyn Fn(Value) -> Result<AnyValue, serde_json::Error> + Send + Sync>;
type EncodeOutput = Arc<dyn Fn(AnyValue) -> Result<Value, ExecuteError> + Send + Sync>;

/// In-process implementation of an extension: the typed handler plus the
/// codec pair bridging wire payloads to the handler's native types. Typed
/// in-process calls use `invoke` directly; wire-originated calls go through
/// `decode_input` and `encode_output`.
#[derive(Clone)]
pub(crate) struct LocalHandler {
    pub invoke: Invoke,
    pub decode_input: DecodeInput,
    pub encode_output: EncodeOutput,
}

impl std::fmt::Debug for LocalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHandler").finish_non_exhaustive()
    }
}

impl LocalHandler {
    pub fn new<IN, OUT, F>(extension_id: &str, handler: F) -> Self
    where
        IN: DeserializeOwned + Send + 'static,
        OUT: Serialize + Send + 'static,
        F: Fn(IN) -> anyhow::Result<OUT> + Send + Sync + 'static,
    {
        let id = extension_id.to_owned();
        let invoke: Invoke = {
            let id = id.clone();
            Arc::new(move |input: AnyValue| {
                let input = input.downcast::<IN>().map_err(|_| {
                    anyhow::anyhow!("extension \"{id}\" received mismatched input type")
                })?;
                let output = handler(*input)?;
                Ok(Box::new(output) as AnyValue)
            })
        };
        let decode_input: DecodeInput = Arc::new(|value| {
            serde_json::from_value::<IN>(value).map(|input| Box::new(input) as AnyValue)
        });
        let encode_output: EncodeOutput = Arc::new(move |output| {
            let output = output
                .downcast::<OUT>()
                .map_err(|_| ExecuteError::OutputType {
                    extension: id.clone(),
                })?;
            serde_json::to_value(*output).map_err(ExecuteError::Codec)
        });
        Self {
            invoke,
            decode_input,
            encode_output,
        }
    }
}

/// Exactly one of a remote connection or an in-process handler backs every
/// registered extension.
#[derive(Clone, Debug)]
pub(crate) enum ExtensionKind {
    Local(LocalHandler),
    Remote(Arc<Session>),
}

/// One registered extension: its declaration plus how to dispatch it.
#[derive(Clone, Debug)]
pub(crate) struct ExtensionRuntime {
    pub cfg: ExtensionConfig,
    pub kind: ExtensionKind,
}
