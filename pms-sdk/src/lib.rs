#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

//! PMS plugin SDK shared between the extension-manager host and plugin
//! processes.
//!
//! This crate provides the JSON protocol definitions exchanged over the
//! loopback websocket channel as well as the plugin-side runtime that plugin
//! authors embed in their binaries.

pub mod protocol {
    //! Shared protocol definitions between the host and plugin processes.
    //!
    //! Every frame on the wire is a text websocket message carrying a single
    //! serialized [`Message`]. Field names are fixed by the protocol and do
    //! not follow Rust naming conventions.

    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use uuid::Uuid;

    fn is_false(value: &bool) -> bool {
        !*value
    }

    /// Command discriminator carried by every frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Command {
        /// A plugin announces itself and its extensions to the host.
        #[serde(rename = "registerPlugin")]
        RegisterPlugin,
        /// An extension invocation request, or a response to one when
        /// `correlationID` is set.
        #[serde(rename = "executeExtension")]
        ExecuteExtension,
    }

    /// A single frame exchanged between the host and a plugin.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Message {
        /// Type of the message.
        pub command: Command,
        /// Unique ID of the message.
        #[serde(rename = "msgID", default)]
        pub msg_id: String,
        /// Empty for requests; equal to the request's `msgID` for responses.
        #[serde(rename = "correlationID", default, skip_serializing_if = "String::is_empty")]
        pub correlation_id: String,
        /// Payload as an opaque JSON value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub data: Option<Value>,
        /// Set on responses when request processing failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub error: Option<PluginError>,
        /// Marks the last response when a single request produces several.
        #[serde(rename = "isFinal", default, skip_serializing_if = "is_false")]
        pub is_final: bool,
    }

    impl Message {
        /// Build a request frame with a fresh message ID.
        pub fn request(command: Command, data: Value) -> Self {
            Self {
                command,
                msg_id: Uuid::new_v4().to_string(),
                correlation_id: String::new(),
                data: Some(data),
                error: None,
                is_final: true,
            }
        }

        /// Build a successful `executeExtension` response correlated with
        /// `request_id`.
        pub fn response(request_id: &str, data: Value, is_final: bool) -> Self {
            Self {
                command: Command::ExecuteExtension,
                msg_id: Uuid::new_v4().to_string(),
                correlation_id: request_id.to_owned(),
                data: Some(data),
                error: None,
                is_final,
            }
        }

        /// Build a final error response correlated with `request_id`.
        pub fn error_response(request_id: &str, error: PluginError) -> Self {
            Self {
                command: Command::ExecuteExtension,
                msg_id: Uuid::new_v4().to_string(),
                correlation_id: request_id.to_owned(),
                data: None,
                error: Some(error),
                is_final: true,
            }
        }
    }

    /// Wire representation of an extension failure.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
    #[error("{message}")]
    pub struct PluginError {
        /// Originating side and extension, e.g. `plugin.a::hello`.
        #[serde(rename = "type", default)]
        pub kind: String,
        /// Human readable error message.
        #[serde(default)]
        pub message: String,
    }

    impl PluginError {
        /// Create a new error record.
        pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
            Self {
                kind: kind.into(),
                message: message.into(),
            }
        }
    }

    /// Payload of a `registerPlugin` request.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RegisterPluginData {
        /// Identifier the plugin registers under.
        #[serde(rename = "pluginID")]
        pub plugin_id: String,
        /// The pre-shared secret the host injected at spawn time.
        pub secret: String,
        /// Extensions contributed by the plugin.
        #[serde(default)]
        pub extensions: Vec<ExtensionConfig>,
    }

    /// Declaration of a single extension instance.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ExtensionConfig {
        /// Globally unique identifier of this extension instance.
        #[serde(rename = "ID")]
        pub id: String,
        /// The named extension point this instance contributes to.
        #[serde(rename = "ExtensionPointID")]
        pub extension_point_id: String,
        /// Extensions this instance must run before. Unknown IDs are
        /// optional and ignored during ordering.
        #[serde(rename = "BeforeExtensionIDs", default)]
        pub before_extension_ids: Vec<String>,
        /// Extensions this instance must run after. Unknown IDs are
        /// optional and ignored during ordering.
        #[serde(rename = "AfterExtensionIDs", default)]
        pub after_extension_ids: Vec<String>,
    }

    impl ExtensionConfig {
        /// Declare an extension under the given extension point.
        pub fn new(id: impl Into<String>, extension_point_id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                extension_point_id: extension_point_id.into(),
                before_extension_ids: Vec::new(),
                after_extension_ids: Vec::new(),
            }
        }

        /// Require this extension to run before the listed extension IDs.
        pub fn with_before<I, S>(mut self, ids: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.before_extension_ids = ids.into_iter().map(Into::into).collect();
            self
        }

        /// Require this extension to run after the listed extension IDs.
        pub fn with_after<I, S>(mut self, ids: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.after_extension_ids = ids.into_iter().map(Into::into).collect();
            self
        }
    }

    /// Payload of an `executeExtension` request.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ExecuteExtensionData {
        /// Extension point being invoked.
        #[serde(rename = "extensionPointID")]
        pub extension_point_id: String,
        /// Target extension. Empty on plugin-originated requests, which
        /// address a whole extension point.
        #[serde(rename = "extensionID", default)]
        pub extension_id: String,
        /// Input for the extension as an opaque JSON value.
        #[serde(default)]
        pub data: Option<Value>,
    }

}

pub mod runtime {
    //! Plugin-side runtime: connects to the host, registers the declared
    //! extensions and serves invocation requests until the host closes the
    //! connection.

    use std::collections::HashMap;
    use std::marker::PhantomData;
    use std::sync::Arc;

    use futures_util::{SinkExt, Stream, StreamExt};
    use parking_lot::Mutex;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, tungstenite};

    use crate::protocol::{
        Command, ExecuteExtensionData, Message, PluginError, RegisterPluginData,
    };
    pub use crate::protocol::ExtensionConfig;

    /// Errors raised by the plugin runtime itself (not by extensions).
    #[derive(Debug, thiserror::Error)]
    pub enum RuntimeError {
        /// The `-pms-port`/`-pms-secret` arguments were missing or malformed.
        #[error("missing or invalid -pms-port/-pms-secret arguments")]
        MissingHostArgs,
        /// Connecting to the host listener failed.
        #[error("connect to host: {0}")]
        Connect(#[source] tungstenite::Error),
        /// An inbound frame was not a valid protocol message.
        #[error("decode host frame: {0}")]
        Protocol(#[source] serde_json::Error),
        /// Building the tokio runtime failed.
        #[error("start plugin runtime: {0}")]
        Io(#[source] std::io::Error),
    }

    /// Errors produced by a reentrant [`PluginContext::execute_extension`]
    /// call.
    #[derive(Debug, thiserror::Error)]
    pub enum CallError {
        /// The host reported an extension failure.
        #[error("{0}")]
        Remote(#[from] PluginError),
        /// Encoding the input or decoding a result payload failed.
        #[error("extension payload codec: {0}")]
        Codec(#[from] serde_json::Error),
        /// The connection to the host is gone.
        #[error("connection to host closed")]
        ConnectionClosed,
    }

    type ErasedHandler =
        Arc<dyn Fn(&PluginContext, Value) -> anyhow::Result<Value> + Send + Sync>;
    type Handlers = HashMap<String, HashMap<String, ErasedHandler>>;
    type WaiterMap = HashMap<String, mpsc::UnboundedSender<Result<Value, CallError>>>;

    struct Shared {
        plugin_id: String,
        out_tx: mpsc::UnboundedSender<Message>,
        waiters: Mutex<WaiterMap>,
    }

    /// A plugin under construction: an identifier plus its extension
    /// declarations and handlers.
    pub struct Plugin {
        plugin_id: String,
        extensions: Vec<(ExtensionConfig, ErasedHandler)>,
    }

    impl Plugin {
        /// Start declaring a plugin registered under `plugin_id`.
        pub fn new(plugin_id: impl Into<String>) -> Self {
            Self {
                plugin_id: plugin_id.into(),
                extensions: Vec::new(),
            }
        }

        /// Contribute an extension. The handler runs on a blocking thread and
        /// may perform reentrant host calls through the [`PluginContext`].
        pub fn extension<IN, OUT, F>(mut self, cfg: ExtensionConfig, handler: F) -> Self
        where
            IN: DeserializeOwned + Send + 'static,
            OUT: Serialize + Send + 'static,
            F: Fn(&PluginContext, IN) -> anyhow::Result<OUT> + Send + Sync + 'static,
        {
            use anyhow::Context as _;
            let erased: ErasedHandler = Arc::new(move |ctx, value| {
                let input: IN =
                    serde_json::from_value(value).context("decode extension input")?;
                let output = handler(ctx, input)?;
                serde_json::to_value(output).context("encode extension output")
            });
            self.extensions.push((cfg, erased));
            self
        }

        /// Parse the host-injected arguments, build a runtime and serve until
        /// the host closes the connection. This is the entry point for plugin
        /// binaries.
        pub fn run(self) -> Result<(), RuntimeError> {
            let args = HostArgs::from_env().ok_or(RuntimeError::MissingHostArgs)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(RuntimeError::Io)?;
            runtime.block_on(self.serve(args.port, &args.secret))
        }

        /// Connect to the host on `port`, register with `secret` and serve
        /// invocation requests. Returns once the host closes the connection.
        pub async fn serve(self, port: u16, secret: &str) -> Result<(), RuntimeError> {
            let url = format!("ws://127.0.0.1:{port}/");
            let (ws, _) = connect_async(url.as_str()).await.map_err(RuntimeError::Connect)?;
            let (mut sink, mut stream) = ws.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
            let writer = tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(err) => {
                            log::error!("encode outbound frame: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(WsMessage::Text(text)).await {
                        log::warn!("write to host failed: {err}");
                        break;
                    }
                }
            });

            let mut configs = Vec::with_capacity(self.extensions.len());
            let mut handlers: Handlers = HashMap::new();
            for (cfg, handler) in self.extensions {
                configs.push(cfg.clone());
                handlers
                    .entry(cfg.extension_point_id.clone())
                    .or_default()
                    .insert(cfg.id, handler);
            }
            let handlers = Arc::new(handlers);

            let shared = Arc::new(Shared {
                plugin_id: self.plugin_id.clone(),
                out_tx,
                waiters: Mutex::new(HashMap::new()),
            });

            let register = RegisterPluginData {
                plugin_id: self.plugin_id,
                secret: secret.to_owned(),
                extensions: configs,
            };
            let data = serde_json::to_value(register).map_err(RuntimeError::Protocol)?;
            let _ = shared
                .out_tx
                .send(Message::request(Command::RegisterPlugin, data));

            let result = read_loop(&shared, &handlers, &mut stream).await;

            // Unblock any handler still waiting on a reentrant call.
            let waiters = std::mem::take(&mut *shared.waiters.lock());
            for (_, waiter) in waiters {
                let _ = waiter.send(Err(CallError::ConnectionClosed));
            }
            writer.abort();
            result
        }
    }

    async fn read_loop<S>(
        shared: &Arc<Shared>,
        handlers: &Arc<Handlers>,
        stream: &mut S,
    ) -> Result<(), RuntimeError>
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("read from host failed: {err}");
                    break;
                }
            };
            let text = match frame {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let msg: Message =
                serde_json::from_str(&text).map_err(RuntimeError::Protocol)?;
            match msg.command {
                Command::ExecuteExtension if !msg.correlation_id.is_empty() => {
                    deliver_response(shared, msg);
                }
                Command::ExecuteExtension => dispatch_request(shared, handlers, msg),
                Command::RegisterPlugin => {
                    log::warn!("host sent unexpected registerPlugin frame");
                }
            }
        }
        Ok(())
    }

    /// Route an invocation result to the waiter that issued the request.
    /// Non-final frames keep the waiter installed so the stream continues;
    /// a final frame with neither data nor error only terminates it.
    fn deliver_response(shared: &Arc<Shared>, msg: Message) {
        let waiter = {
            let mut waiters = shared.waiters.lock();
            if msg.is_final {
                waiters.remove(&msg.correlation_id)
            } else {
                waiters.get(&msg.correlation_id).cloned()
            }
        };
        let Some(waiter) = waiter else {
            log::warn!("unknown correlationID {}", msg.correlation_id);
            return;
        };
        let item = match (msg.error, msg.data) {
            (Some(err), _) => Err(CallError::Remote(err)),
            (None, Some(data)) => Ok(data),
            // the empty-stream terminator: dropping the waiter ends the
            // result iterator without an item
            (None, None) if msg.is_final => return,
            (None, None) => Ok(Value::Null),
        };
        let _ = waiter.send(item);
    }

    fn dispatch_request(shared: &Arc<Shared>, handlers: &Arc<Handlers>, msg: Message) {
        let request_id = msg.msg_id.clone();
        let request: ExecuteExtensionData =
            match serde_json::from_value(msg.data.unwrap_or(Value::Null)) {
                Ok(request) => request,
                Err(err) => {
                    let error = PluginError::new(
                        shared.plugin_id.clone(),
                        format!("decode executeExtension request: {err}"),
                    );
                    let _ = shared.out_tx.send(Message::error_response(&request_id, error));
                    return;
                }
            };

        let handler = handlers
            .get(&request.extension_point_id)
            .and_then(|by_id| by_id.get(&request.extension_id))
            .cloned();
        let Some(handler) = handler else {
            let error = PluginError::new(
                shared.plugin_id.clone(),
                format!(
                    "unknown extension {}/{}",
                    request.extension_point_id, request.extension_id
                ),
            );
            let _ = shared.out_tx.send(Message::error_response(&request_id, error));
            return;
        };

        let shared = Arc::clone(shared);
        let extension_id = request.extension_id;
        let input = request.data.unwrap_or(Value::Null);
        tokio::spawn(async move {
            let ctx = PluginContext {
                shared: Arc::clone(&shared),
            };
            let result =
                tokio::task::spawn_blocking(move || handler(&ctx, input)).await;
            let response = match result {
                Ok(Ok(output)) => Message::response(&request_id, output, true),
                Ok(Err(err)) => Message::error_response(
                    &request_id,
                    PluginError::new(
                        format!("{}::{}", shared.plugin_id, extension_id),
                        err.to_string(),
                    ),
                ),
                Err(err) => Message::error_response(
                    &request_id,
                    PluginError::new(
                        format!("{}::{}", shared.plugin_id, extension_id),
                        format!("extension handler aborted: {err}"),
                    ),
                ),
            };
            let _ = shared.out_tx.send(response);
        });
    }

    /// Handle passed to extension handlers for reentrant host invocations.
    #[derive(Clone)]
    pub struct PluginContext {
        shared: Arc<Shared>,
    }

    impl PluginContext {
        /// Identifier this plugin registered under.
        pub fn plugin_id(&self) -> &str {
            &self.shared.plugin_id
        }

        /// Ask the host to execute an extension point and iterate over the
        /// streamed per-extension results.
        ///
        /// The returned iterator blocks on the connection and must only be
        /// used from an extension handler (handlers run on blocking
        /// threads), never from an async task.
        pub fn execute_extension<IN, OUT>(
            &self,
            extension_point_id: &str,
            input: IN,
        ) -> ExtensionResults<OUT>
        where
            IN: Serialize,
            OUT: DeserializeOwned,
        {
            let (tx, rx) = mpsc::unbounded_channel();
            let results = ExtensionResults {
                rx,
                _out: PhantomData,
            };

            let data = match serde_json::to_value(input) {
                Ok(data) => data,
                Err(err) => {
                    let _ = tx.send(Err(CallError::Codec(err)));
                    return results;
                }
            };
            let payload = ExecuteExtensionData {
                extension_point_id: extension_point_id.to_owned(),
                extension_id: String::new(),
                data: Some(data),
            };
            let payload = match serde_json::to_value(payload) {
                Ok(payload) => payload,
                Err(err) => {
                    let _ = tx.send(Err(CallError::Codec(err)));
                    return results;
                }
            };

            let msg = Message::request(Command::ExecuteExtension, payload);
            let msg_id = msg.msg_id.clone();
            self.shared.waiters.lock().insert(msg_id.clone(), tx.clone());
            if self.shared.out_tx.send(msg).is_err() {
                self.shared.waiters.lock().remove(&msg_id);
                let _ = tx.send(Err(CallError::ConnectionClosed));
            }
            results
        }
    }

    /// Blocking iterator over the results of one extension-point invocation.
    ///
    /// Yields one item per extension executed by the host, in host order;
    /// the stream ends after the final frame or on the first error.
    pub struct ExtensionResults<OUT> {
        rx: mpsc::UnboundedReceiver<Result<Value, CallError>>,
        _out: PhantomData<OUT>,
    }

    impl<OUT: DeserializeOwned> Iterator for ExtensionResults<OUT> {
        type Item = Result<OUT, CallError>;

        fn next(&mut self) -> Option<Self::Item> {
            let item = self.rx.blocking_recv()?;
            Some(item.and_then(|value| {
                serde_json::from_value(value).map_err(CallError::Codec)
            }))
        }
    }

    struct HostArgs {
        port: u16,
        secret: String,
    }

    impl HostArgs {
        fn from_env() -> Option<Self> {
            Self::parse(std::env::args().skip(1))
        }

        // The single-dash long flags are fixed by the wire contract, so the
        // arguments are scanned by hand rather than with a CLI parser.
        fn parse(mut args: impl Iterator<Item = String>) -> Option<Self> {
            let mut port = None;
            let mut secret = None;
            while let Some(arg) = args.next() {
                match arg.trim_start_matches('-') {
                    "pms-port" if arg.starts_with('-') => {
                        port = args.next()?.parse::<u16>().ok();
                    }
                    "pms-secret" if arg.starts_with('-') => {
                        secret = args.next();
                    }
                    _ => {}
                }
            }
            Some(Self {
                port: port?,
                secret: secret?,
            })
        }
    }

}

pub use protocol::{Command, ExecuteExtensionData, ExtensionConfig, Message, PluginError};
pub use runtime::{CallError, ExtensionResults, Plugin, PluginContext, RuntimeError};
