//! Execution engine: iterates the ordered extensions of one extension
//! point and publishes each result onto a lazy sequence.
//!
//! Host extensions are callable both from typed in-process call sites and
//! from wire invocations. The typed path hands the input straight to the
//! handler; the raw path goes through the extension's input-decoder and
//! output-encoder.

use std::sync::Arc;

use pms_sdk::protocol::{Command, ExecuteExtensionData, ExtensionConfig, Message, PluginError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::correlation::{Delivered, Waiter};
use crate::error::ExecuteError;
use crate::manager::ManagerInner;
use crate::runtime::{AnyValue, ExtensionKind, LocalHandler};
use crate::session::Session;

/// Capacity 1 keeps the sequence lazy: the engine cannot run ahead of the
/// consumer by more than the element being produced.
const RESULT_CAPACITY: usize = 1;

/// Execute an extension point with a typed input. One result per extension,
/// in dispatch order; the sequence closes after the last extension or
/// directly after the first error.
pub(crate) fn execute_typed<IN, OUT>(
    inner: &Arc<ManagerInner>,
    extension_point_id: &str,
    input: IN,
) -> mpsc::Receiver<Result<OUT, ExecuteError>>
where
    IN: Serialize + Clone + Send + Sync + 'static,
    OUT: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RESULT_CAPACITY);
    let records = inner.extensions_for(extension_point_id);
    let inner = Arc::clone(inner);
    let point = extension_point_id.to_owned();

    tokio::spawn(async move {
        for record in records {
            let item: Result<OUT, ExecuteError> = match &record.kind {
                ExtensionKind::Local(handler) => {
                    invoke_local_typed(handler, &record.cfg, input.clone())
                }
                ExtensionKind::Remote(session) => match serde_json::to_value(&input) {
                    Ok(raw) => {
                        dispatch_remote::<OUT>(&inner, session, &record.cfg, &point, raw)
                            .await
                            .and_then(|value| downcast_output(value, &record.cfg.id))
                    }
                    Err(err) => Err(ExecuteError::Codec(err)),
                },
            };
            if !publish(&tx, item).await {
                return;
            }
        }
    });
    rx
}

/// Execute an extension point with wire-originated opaque input, yielding
/// opaque outputs. This is the path reentrant plugin requests take.
pub(crate) fn execute_raw(
    inner: &Arc<ManagerInner>,
    extension_point_id: &str,
    input: Value,
) -> mpsc::Receiver<Result<Value, ExecuteError>> {
    let (tx, rx) = mpsc::channel(RESULT_CAPACITY);
    let records = inner.extensions_for(extension_point_id);
    let inner = Arc::clone(inner);
    let point = extension_point_id.to_owned();

    tokio::spawn(async move {
        for record in records {
            let item: Result<Value, ExecuteError> = match &record.kind {
                ExtensionKind::Local(handler) => {
                    invoke_local_raw(handler, &record.cfg, input.clone())
                }
                ExtensionKind::Remote(session) => {
                    dispatch_remote::<Value>(&inner, session, &record.cfg, &point, input.clone())
                        .await
                        .and_then(|value| downcast_output(value, &record.cfg.id))
                }
            };
            if !publish(&tx, item).await {
                return;
            }
        }
    });
    rx
}

/// Emit one item. Returns whether the engine should continue: it stops on
/// the first error and when the consumer has dropped the sequence.
async fn publish<T>(tx: &mpsc::Sender<Result<T, ExecuteError>>, item: Result<T, ExecuteError>) -> bool {
    let failed = item.is_err();
    if tx.send(item).await.is_err() {
        // consumer dropped the sequence; stop dispatching
        return false;
    }
    !failed
}

fn invoke_local_typed<IN, OUT>(
    handler: &LocalHandler,
    cfg: &ExtensionConfig,
    input: IN,
) -> Result<OUT, ExecuteError>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    match (handler.invoke)(Box::new(input)) {
        Ok(output) => downcast_output(output, &cfg.id),
        Err(err) => Err(handler_failure(cfg, err)),
    }
}

/// Wire-originated input goes through the record's codec pair around the
/// typed handler.
fn invoke_local_raw(
    handler: &LocalHandler,
    cfg: &ExtensionConfig,
    input: Value,
) -> Result<Value, ExecuteError> {
    let input = (handler.decode_input)(input).map_err(ExecuteError::Codec)?;
    let output = (handler.invoke)(input).map_err(|err| handler_failure(cfg, err))?;
    (handler.encode_output)(output)
}

fn handler_failure(cfg: &ExtensionConfig, err: anyhow::Error) -> ExecuteError {
    ExecuteError::Extension(PluginError::new(format!("host::{}", cfg.id), err.to_string()))
}

/// Send one `executeExtension` request over the owning connection and block
/// on its waiter. The waiter is installed in both registries before the
/// frame is written, so a response can never outrun it.
async fn dispatch_remote<OUT>(
    inner: &Arc<ManagerInner>,
    session: &Arc<Session>,
    cfg: &ExtensionConfig,
    extension_point_id: &str,
    input: Value,
) -> Result<AnyValue, ExecuteError>
where
    OUT: DeserializeOwned + Send + 'static,
{
    let payload = ExecuteExtensionData {
        extension_point_id: extension_point_id.to_owned(),
        extension_id: cfg.id.clone(),
        data: Some(input),
    };
    let payload = serde_json::to_value(payload).map_err(ExecuteError::Codec)?;
    let msg = Message::request(Command::ExecuteExtension, payload);
    let msg_id = msg.msg_id.clone();

    let (tx, rx) = oneshot::channel();
    inner.insert_waiter(session.id, msg_id.clone(), Waiter::new::<OUT>(tx));

    if let Err(err) = session.send(&msg).await {
        inner.remove_waiter(session.id, &msg_id);
        return Err(err);
    }

    match rx.await {
        Ok(Delivered::Value(value)) => Ok(value),
        Ok(Delivered::Failure(err)) => Err(err),
        Err(_) => Err(ExecuteError::PluginFailed),
    }
}

fn downcast_output<OUT: 'static>(value: AnyValue, extension: &str) -> Result<OUT, ExecuteError> {
    value
        .downcast::<OUT>()
        .map(|output| *output)
        .map_err(|_| ExecuteError::OutputType {
            extension: extension.to_owned(),
        })
}
