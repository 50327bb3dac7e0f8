use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pms_sdk::protocol::{
    Command, ExecuteExtensionData, Message, PluginError, RegisterPluginData,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::error::{ExecuteError, ManagerError};
use crate::execute;
use crate::manager::ManagerInner;
use crate::runtime::{ExtensionKind, ExtensionRuntime};

type Sink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// One live plugin connection: the write half plus the session identity
/// under which this connection's in-flight waiters are indexed.
pub(crate) struct Session {
    pub id: u64,
    writer: tokio::sync::Mutex<Sink>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    /// Serialize and write one frame. The sink mutex serializes all writes
    /// on this connection.
    pub async fn send(&self, msg: &Message) -> Result<(), ExecuteError> {
        let text = serde_json::to_string(msg).map_err(ExecuteError::Codec)?;
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(ExecuteError::Transport)
    }
}

/// Serve one inbound connection until it closes or produces an unreadable
/// frame, then fail every waiter still tied to it.
pub(crate) async fn run(inner: Arc<ManagerInner>, stream: TcpStream) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            log::warn!("websocket upgrade failed: {err}");
            return;
        }
    };
    let (sink, mut reader) = ws.split();
    let session = Arc::new(Session {
        id: inner.next_session_id(),
        writer: tokio::sync::Mutex::new(sink),
    });

    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                log::warn!("read from plugin failed: {err}");
                break;
            }
        };
        let msg: Message = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                // a malformed frame terminates this session, not the manager
                log::warn!("invalid frame from plugin: {err}");
                break;
            }
        };
        match msg.command {
            Command::RegisterPlugin => register_plugin(&inner, &session, msg),
            Command::ExecuteExtension if !msg.correlation_id.is_empty() => {
                deliver_response(&inner, &session, msg);
            }
            Command::ExecuteExtension => {
                // reentrant request; never block the read loop on it
                tokio::spawn(handle_request(
                    Arc::clone(&inner),
                    Arc::clone(&session),
                    msg,
                ));
            }
        }
    }

    inner.fail_session_waiters(session.id);
}

/// Append the plugin's extensions to their extension points (ordering is
/// deferred to cohort completion) and signal the secret registry.
fn register_plugin(inner: &Arc<ManagerInner>, session: &Arc<Session>, msg: Message) {
    let data: RegisterPluginData =
        match serde_json::from_value(msg.data.unwrap_or(Value::Null)) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("invalid registerPlugin payload: {err}");
                return;
            }
        };
    let RegisterPluginData {
        plugin_id,
        secret,
        extensions,
    } = data;

    {
        let mut state = inner.state.lock();
        state.plugins.insert(plugin_id.clone(), Arc::clone(session));
        for cfg in extensions {
            state
                .extensions
                .entry(cfg.extension_point_id.clone())
                .or_default()
                .push(ExtensionRuntime {
                    cfg,
                    kind: ExtensionKind::Remote(Arc::clone(session)),
                });
        }
    }

    if !inner.secrets.take(&secret) {
        log::warn!("plugin `{plugin_id}` presented an unknown secret");
    }
    log::info!("plugin `{plugin_id}` registered");
    let _ = inner.registration_tx.send(secret);
}

/// Response path: hand the frame to the waiter tracked under its
/// correlation ID and drop the waiter from both registries.
fn deliver_response(inner: &Arc<ManagerInner>, session: &Arc<Session>, msg: Message) {
    let waiter = inner.remove_waiter(session.id, &msg.correlation_id);
    let Some(waiter) = waiter else {
        inner.failure(ManagerError::UnknownCorrelation(msg.correlation_id));
        return;
    };
    match msg.error {
        Some(err) => waiter.fail(ExecuteError::Extension(err)),
        None => waiter.resolve(msg.data),
    }
}

/// Request path: a plugin asks the host to run an extension point. Stream
/// the produced results back on the same connection, marking the last frame
/// final; a result carrying no data and no error terminates an empty
/// stream.
async fn handle_request(inner: Arc<ManagerInner>, session: Arc<Session>, msg: Message) {
    let request_id = msg.msg_id;
    let request: ExecuteExtensionData =
        match serde_json::from_value(msg.data.unwrap_or(Value::Null)) {
            Ok(request) => request,
            Err(err) => {
                let error = PluginError::new(
                    "host",
                    format!("decode executeExtension request: {err}"),
                );
                write_response(&inner, &session, Message::error_response(&request_id, error))
                    .await;
                return;
            }
        };

    let mut results = execute::execute_raw(
        &inner,
        &request.extension_point_id,
        request.data.unwrap_or(Value::Null),
    );

    let mut pending: Option<Value> = None;
    while let Some(result) = results.recv().await {
        match result {
            Ok(value) => {
                if let Some(previous) = pending.take() {
                    if !write_response(
                        &inner,
                        &session,
                        Message::response(&request_id, previous, false),
                    )
                    .await
                    {
                        return;
                    }
                }
                pending = Some(value);
            }
            Err(err) => {
                if let Some(previous) = pending.take() {
                    if !write_response(
                        &inner,
                        &session,
                        Message::response(&request_id, previous, false),
                    )
                    .await
                    {
                        return;
                    }
                }
                let error = match err {
                    ExecuteError::Extension(error) => error,
                    other => PluginError::new("host", other.to_string()),
                };
                write_response(&inner, &session, Message::error_response(&request_id, error))
                    .await;
                return;
            }
        }
    }

    let last = match pending {
        Some(value) => Message::response(&request_id, value, true),
        // no extension produced anything; close the stream explicitly
        None => Message {
            command: Command::ExecuteExtension,
            msg_id: String::new(),
            correlation_id: request_id.clone(),
            data: None,
            error: None,
            is_final: true,
        },
    };
    write_response(&inner, &session, last).await;
}

async fn write_response(inner: &Arc<ManagerInner>, session: &Arc<Session>, msg: Message) -> bool {
    match session.send(&msg).await {
        Ok(()) => true,
        Err(err) => {
            inner.failure(ManagerError::ResponseWrite(err.to_string()));
            false
        }
    }
}
