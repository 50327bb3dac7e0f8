use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pms_sdk::protocol::ExtensionConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationRegistry, Waiter};
use crate::error::{ExecuteError, ManagerError};
use crate::launcher;
use crate::ordering::order_extensions;
use crate::runtime::{ExtensionKind, ExtensionRuntime, LocalHandler};
use crate::secret::SecretRegistry;
use crate::session::{self, Session};

/// Callback invoked for failures that are not tied to a single request:
/// ordering errors, spawn errors, protocol anomalies. The default processor
/// forwards onto the manager error channel observed by `load_plugins`.
pub type FailureProcessor = Arc<dyn Fn(ManagerError) + Send + Sync>;

/// Everything guarded by the manager mutex: the extension-runtime maps, the
/// correlation registry, the per-connection waiter sets, the plugin map and
/// the ordered flag.
#[derive(Default)]
pub(crate) struct ManagerState {
    pub extensions: HashMap<String, Vec<ExtensionRuntime>>,
    pub waiters: CorrelationRegistry,
    pub session_waiters: HashMap<u64, HashSet<String>>,
    pub plugins: HashMap<String, Arc<Session>>,
    pub ordered: bool,
}

pub(crate) struct ManagerInner {
    pub debug: bool,
    port: u16,
    pub state: Mutex<ManagerState>,
    pub secrets: SecretRegistry,
    pub registration_tx: mpsc::UnboundedSender<String>,
    registration_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    errors_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ManagerError>>,
    failure_processor: FailureProcessor,
    session_counter: AtomicU64,
}

impl ManagerInner {
    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn failure(&self, err: ManagerError) {
        (self.failure_processor)(err);
    }

    /// Snapshot the ordered records of one extension point.
    pub fn extensions_for(&self, extension_point_id: &str) -> Vec<ExtensionRuntime> {
        let state = self.state.lock();
        if !state.ordered {
            log::debug!("executing `{extension_point_id}` before any ordering pass");
        }
        state
            .extensions
            .get(extension_point_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Track an in-flight request in the process-wide registry and in the
    /// owning session's set.
    pub fn insert_waiter(&self, session_id: u64, msg_id: String, waiter: Waiter) {
        let mut state = self.state.lock();
        state
            .session_waiters
            .entry(session_id)
            .or_default()
            .insert(msg_id.clone());
        state.waiters.insert(msg_id, waiter);
    }

    pub fn remove_waiter(&self, session_id: u64, msg_id: &str) -> Option<Waiter> {
        let mut state = self.state.lock();
        if let Some(ids) = state.session_waiters.get_mut(&session_id) {
            ids.remove(msg_id);
        }
        state.waiters.remove(msg_id)
    }

    /// Fail every waiter still in flight on a closed connection and forget
    /// the plugin registration bound to it. Delivery happens outside the
    /// lock.
    pub fn fail_session_waiters(&self, session_id: u64) {
        let waiters: Vec<Waiter> = {
            let mut state = self.state.lock();
            state.plugins.retain(|_, session| session.id != session_id);
            let ids = state.session_waiters.remove(&session_id).unwrap_or_default();
            ids.iter()
                .filter_map(|id| state.waiters.remove(id))
                .collect()
        };
        for waiter in waiters {
            waiter.fail(ExecuteError::PluginFailed);
        }
    }
}

/// Configure a manager before binding its listener.
pub struct ManagerBuilder {
    debug: bool,
    fixed_port: Option<u16>,
    failure_processor: Option<FailureProcessor>,
}

impl ManagerBuilder {
    /// Inherit plugin stdout/stderr instead of discarding it.
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Pin the listener to `port` instead of picking an ephemeral one.
    pub fn with_fixed_port(mut self, port: u16) -> Self {
        self.fixed_port = Some(port);
        self
    }

    /// Replace the default failure processor.
    pub fn with_failure_processor(mut self, processor: FailureProcessor) -> Self {
        self.failure_processor = Some(processor);
        self
    }

    /// Bind the loopback listener and start accepting plugin connections in
    /// a background task.
    pub async fn init(self) -> Result<WsManager, ManagerError> {
        let listener = TcpListener::bind(("127.0.0.1", self.fixed_port.unwrap_or(0)))
            .await
            .map_err(ManagerError::Listen)?;
        let port = listener
            .local_addr()
            .map_err(ManagerError::Listen)?
            .port();

        let (registration_tx, registration_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let failure_processor = self.failure_processor.unwrap_or_else(|| {
            Arc::new(move |err| {
                let _ = errors_tx.send(err);
            })
        });

        let inner = Arc::new(ManagerInner {
            debug: self.debug,
            port,
            state: Mutex::new(ManagerState::default()),
            secrets: SecretRegistry::default(),
            registration_tx,
            registration_rx: tokio::sync::Mutex::new(registration_rx),
            errors_rx: tokio::sync::Mutex::new(errors_rx),
            failure_processor,
            session_counter: AtomicU64::new(1),
        });

        let accept = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(session::run(Arc::clone(&accept), stream));
                    }
                    Err(err) => {
                        log::error!("accept plugin connection: {err}");
                        break;
                    }
                }
            }
        });

        log::info!("plugin manager listening on 127.0.0.1:{port}");
        Ok(WsManager { inner })
    }
}

/// Host-side extension manager: owns the listener, the registered
/// extensions and the in-flight request registries.
#[derive(Clone)]
pub struct WsManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl WsManager {
    /// Start configuring a new manager.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder {
            debug: false,
            fixed_port: None,
            failure_processor: None,
        }
    }

    /// Port the manager accepts plugin connections on.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Register an in-process extension. Host extensions are declared
    /// before `load_plugins`, which fixes their order relative to plugin
    /// contributions.
    pub fn register_host_extension<IN, OUT, F>(&self, cfg: ExtensionConfig, handler: F)
    where
        IN: DeserializeOwned + Send + 'static,
        OUT: Serialize + Send + 'static,
        F: Fn(IN) -> anyhow::Result<OUT> + Send + Sync + 'static,
    {
        let handler = LocalHandler::new::<IN, OUT, F>(&cfg.id, handler);
        let mut state = self.inner.state.lock();
        state
            .extensions
            .entry(cfg.extension_point_id.clone())
            .or_default()
            .push(ExtensionRuntime {
                cfg,
                kind: ExtensionKind::Local(handler),
            });
    }

    /// Spawn the given plugin commands and wait until every one of them has
    /// registered, then order all extension points. Returns early on
    /// cancellation or on the first lifecycle error.
    pub async fn load_plugins<I, S>(
        &self,
        cancel: &CancellationToken,
        commands: I,
    ) -> Result<(), ManagerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets = Vec::new();
        for command in commands {
            let command = command.into();
            let secret = self.inner.secrets.issue();
            launcher::spawn_plugin(&self.inner, &command, self.port(), &secret);
            secrets.push(secret);
        }

        if secrets.is_empty() {
            self.finish_load();
            return self.surface_pending_error().await;
        }
        self.await_cohort(cancel, secrets).await
    }

    /// Block until every secret in the cohort has been matched, an error
    /// arrives on the manager channel, or the token is cancelled.
    async fn await_cohort(
        &self,
        cancel: &CancellationToken,
        secrets: Vec<String>,
    ) -> Result<(), ManagerError> {
        let mut waiting: HashSet<String> = secrets.into_iter().collect();
        let mut registrations = self.inner.registration_rx.lock().await;
        let mut errors = self.inner.errors_rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ManagerError::Cancelled),
                Some(secret) = registrations.recv() => {
                    waiting.remove(&secret);
                    if waiting.is_empty() {
                        drop(registrations);
                        drop(errors);
                        self.finish_load();
                        return self.surface_pending_error().await;
                    }
                }
                Some(err) = errors.recv() => return Err(err),
            }
        }
    }

    /// Run the ordering engine across every extension point. Ordering
    /// failures are routed through the failure processor like any other
    /// lifecycle error.
    fn finish_load(&self) {
        let mut failed = None;
        {
            let mut state = self.inner.state.lock();
            let mut points: Vec<String> = state.extensions.keys().cloned().collect();
            points.sort();
            for point in points {
                let records = state.extensions.get(&point).cloned().unwrap_or_default();
                match order_extensions(records) {
                    Ok(ordered) => {
                        state.extensions.insert(point, ordered);
                    }
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
            }
            state.ordered = failed.is_none();
        }
        if let Some(err) = failed {
            self.inner.failure(err);
        }
    }

    /// With the default failure processor, an error raised during the
    /// ordering pass is sitting on the manager error channel; surface it to
    /// the `load_plugins` caller.
    async fn surface_pending_error(&self) -> Result<(), ManagerError> {
        if let Ok(mut errors) = self.inner.errors_rx.try_lock() {
            if let Ok(err) = errors.try_recv() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Execute an extension point with a typed input, yielding one result
    /// per extension in dispatch order. The sequence closes after the last
    /// extension or directly after the first error; dropping the receiver
    /// stops dispatch at the next publish point.
    pub fn execute<IN, OUT>(
        &self,
        extension_point_id: &str,
        input: IN,
    ) -> mpsc::Receiver<Result<OUT, ExecuteError>>
    where
        IN: Serialize + Clone + Send + Sync + 'static,
        OUT: DeserializeOwned + Send + 'static,
    {
        crate::execute::execute_typed(&self.inner, extension_point_id, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use pms_sdk::protocol::{Command, Message, RegisterPluginData};
    use pms_sdk::{Plugin, PluginContext};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn init_manager() -> WsManager {
        WsManager::builder().init().await.expect("manager init")
    }

    /// Register the plugin with a freshly issued secret and serve it on a
    /// background task, as `load_plugins` would after spawning it.
    fn start_plugin(manager: &WsManager, plugin: Plugin) -> String {
        let secret = manager.inner.secrets.issue();
        let port = manager.port();
        let serve_secret = secret.clone();
        tokio::spawn(async move {
            if let Err(err) = plugin.serve(port, &serve_secret).await {
                log::warn!("test plugin stopped: {err}");
            }
        });
        secret
    }

    #[tokio::test]
    async fn executes_host_extensions_in_declared_order() {
        let manager = init_manager().await;
        manager.register_host_extension::<String, String, _>(
            ExtensionConfig::new("greet.first", "greet"),
            |name| Ok(format!("hello {name}")),
        );
        manager.register_host_extension::<String, String, _>(
            ExtensionConfig::new("greet.second", "greet").with_after(["greet.first"]),
            |name| Ok(format!("welcome {name}")),
        );
        manager
            .load_plugins(&CancellationToken::new(), Vec::<String>::new())
            .await
            .unwrap();
        assert!(manager.inner.state.lock().ordered);

        let mut results = manager.execute::<String, String>("greet", "ann".into());
        assert_eq!(results.recv().await.unwrap().unwrap(), "hello ann");
        assert_eq!(results.recv().await.unwrap().unwrap(), "welcome ann");
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn first_error_terminates_the_sequence() {
        let manager = init_manager().await;
        manager.register_host_extension::<String, String, _>(
            ExtensionConfig::new("steps.one", "steps"),
            |_| Ok("one".to_string()),
        );
        manager.register_host_extension::<String, String, _>(
            ExtensionConfig::new("steps.two", "steps").with_after(["steps.one"]),
            |_| anyhow::bail!("boom"),
        );
        manager.register_host_extension::<String, String, _>(
            ExtensionConfig::new("steps.three", "steps").with_after(["steps.two"]),
            |_| Ok("three".to_string()),
        );
        manager
            .load_plugins(&CancellationToken::new(), Vec::<String>::new())
            .await
            .unwrap();

        let mut results = manager.execute::<String, String>("steps", "x".into());
        assert_eq!(results.recv().await.unwrap().unwrap(), "one");
        let err = results.recv().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_extension_ids_fail_the_load() {
        let manager = init_manager().await;
        manager.register_host_extension::<String, i64, _>(
            ExtensionConfig::new("app.getRandomNumber.default", "qwe"),
            |_| Ok(6),
        );
        manager.register_host_extension::<String, i64, _>(
            ExtensionConfig::new("app.getRandomNumber.default", "qwe"),
            |_| Ok(6),
        );
        let err = manager
            .load_plugins(&CancellationToken::new(), Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateExtension(id)
            if id == "app.getRandomNumber.default"));
    }

    #[tokio::test]
    async fn cyclic_declarations_fail_the_load() {
        let manager = init_manager().await;
        manager.register_host_extension::<String, i64, _>(
            ExtensionConfig::new("p", "point").with_after(["q"]),
            |_| Ok(1),
        );
        manager.register_host_extension::<String, i64, _>(
            ExtensionConfig::new("q", "point").with_after(["p"]),
            |_| Ok(2),
        );
        let err = manager
            .load_plugins(&CancellationToken::new(), Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::CircularDependency { .. }));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_cohort_wait() {
        let manager = init_manager().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let secret = manager.inner.secrets.issue();
        let err = manager.await_cohort(&cancel, vec![secret]).await.unwrap_err();
        assert!(matches!(err, ManagerError::Cancelled));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_through_the_load() {
        let manager = init_manager().await;
        let err = manager
            .load_plugins(
                &CancellationToken::new(),
                ["/nonexistent/pms-test-plugin"],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Spawn { command, .. }
            if command == "/nonexistent/pms-test-plugin"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plugin_extension_round_trip() {
        let manager = init_manager().await;
        let plugin = Plugin::new("plugin.a").extension::<String, String, _>(
            ExtensionConfig::new("plugin.a.hello", "hello"),
            |_ctx, name| Ok(format!("Hello {name} from plugin A!")),
        );
        let secret = start_plugin(&manager, plugin);
        manager
            .await_cohort(&CancellationToken::new(), vec![secret])
            .await
            .unwrap();

        let mut results = manager.execute::<String, String>("hello", "Anton".into());
        assert_eq!(
            results.recv().await.unwrap().unwrap(),
            "Hello Anton from plugin A!"
        );
        assert!(results.recv().await.is_none());

        // both waiter registries are drained once delivery completed
        let state = manager.inner.state.lock();
        assert!(state.waiters.is_empty());
        assert!(state.session_waiters.values().all(|ids| ids.is_empty()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plugin_extensions_run_in_partial_order() {
        let manager = init_manager().await;
        let plugin = Plugin::new("plugin.a")
            .extension::<String, String, _>(ExtensionConfig::new("a", "hello"), |_ctx, _| {
                Ok("a".to_string())
            })
            .extension::<String, String, _>(
                ExtensionConfig::new("b", "hello").with_after(["a"]),
                |_ctx, _| Ok("b".to_string()),
            )
            .extension::<String, String, _>(
                ExtensionConfig::new("c", "hello")
                    .with_after(["a"])
                    .with_before(["b"]),
                |_ctx, _| Ok("c".to_string()),
            );
        let secret = start_plugin(&manager, plugin);
        manager
            .await_cohort(&CancellationToken::new(), vec![secret])
            .await
            .unwrap();

        let mut results = manager.execute::<String, String>("hello", "x".into());
        let mut order = Vec::new();
        while let Some(result) = results.recv().await {
            order.push(result.unwrap());
        }
        assert_eq!(order, ["a", "c", "b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reentrant_plugin_call_reaches_host_extensions() {
        let manager = init_manager().await;
        manager.register_host_extension::<String, i64, _>(
            ExtensionConfig::new("app.getRandomNumber.default", "app.getRandomNumber"),
            |_| Ok(6),
        );
        let plugin = Plugin::new("plugin.a")
            .extension::<String, i64, _>(
                ExtensionConfig::new("plugin.a.getRandomNumber", "app.getRandomNumber"),
                |_ctx, _| Ok(4),
            )
            .extension::<String, String, _>(
                ExtensionConfig::new("plugin.a.hello", "hello"),
                |ctx: &PluginContext, name| {
                    let mut random = 0i64;
                    for result in ctx.execute_extension::<&str, i64>("app.getRandomNumber", "") {
                        random ^= result?;
                    }
                    Ok(format!("Hello {name}, random {random}"))
                },
            );
        let secret = start_plugin(&manager, plugin);
        manager
            .await_cohort(&CancellationToken::new(), vec![secret])
            .await
            .unwrap();

        let mut results = manager.execute::<String, String>("hello", "Anton".into());
        assert_eq!(
            results.recv().await.unwrap().unwrap(),
            "Hello Anton, random 2"
        );
        assert!(results.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connection_loss_fails_inflight_waiters() {
        let manager = init_manager().await;
        let secret = manager.inner.secrets.issue();
        let port = manager.port();

        // a bare client that registers one extension and hangs up as soon
        // as the first invocation request arrives
        let client_secret = secret.clone();
        tokio::spawn(async move {
            let (ws, _) =
                tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
                    .await
                    .unwrap();
            let (mut sink, mut stream) = ws.split();
            let register = RegisterPluginData {
                plugin_id: "plugin.crash".to_string(),
                secret: client_secret,
                extensions: vec![ExtensionConfig::new("crash.hello", "hello")],
            };
            let msg = Message::request(
                Command::RegisterPlugin,
                serde_json::to_value(register).unwrap(),
            );
            sink.send(WsMessage::Text(serde_json::to_string(&msg).unwrap()))
                .await
                .unwrap();
            let _ = stream.next().await;
        });

        manager
            .await_cohort(&CancellationToken::new(), vec![secret])
            .await
            .unwrap();

        let mut results = manager.execute::<String, String>("hello", "x".into());
        let err = results.recv().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "plugin failed before processing finished");
        assert!(results.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_correlation_goes_to_the_failure_processor() {
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let manager = WsManager::builder()
            .with_failure_processor(Arc::new(move |err| {
                let _ = failures_tx.send(err);
            }))
            .init()
            .await
            .unwrap();
        let port = manager.port();

        tokio::spawn(async move {
            let (ws, _) =
                tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
                    .await
                    .unwrap();
            let (mut sink, _stream) = ws.split();
            let msg = Message::response("ghost", json!(1), true);
            sink.send(WsMessage::Text(serde_json::to_string(&msg).unwrap()))
                .await
                .unwrap();
            // keep the connection open long enough for the frame to land
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let err = failures_rx.recv().await.unwrap();
        assert!(matches!(err, ManagerError::UnknownCorrelation(id) if id == "ghost"));
    }
}
