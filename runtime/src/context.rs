//! Sandboxed execution context: hosts one app's own code.
//!
//! The context is a spawned task consuming [`HostMessage`]s. It owns the
//! bundle instance, translates lifecycle commands into hook calls, and
//! hands the bundle a [`HostApi`] whose outbound calls suspend only the
//! calling task until the correlated response arrives or the fixed 30 s
//! timeout elapses. A terminated context cannot be reinitialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use appdock_types::{
    AppId, AppManifest, AppMessage, BundleError, CorrelationId, HostMessage, LogLevel,
    OutboundRequest, RuntimeError,
};

/// Fixed per-call correlation timeout. Not configurable per app.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The app's own code, behind the hooks the context drives.
///
/// Hooks are synchronous and expected to return quickly; bundles that need
/// to call out asynchronously keep a clone of their [`HostApi`] and spawn
/// their own tasks with it.
pub trait AppBundle: Send {
    fn start(&mut self) -> Result<(), BundleError> {
        Ok(())
    }
    fn stop(&mut self) -> Result<(), BundleError> {
        Ok(())
    }
    fn pause(&mut self) -> Result<(), BundleError> {
        Ok(())
    }
    fn resume(&mut self) -> Result<(), BundleError> {
        Ok(())
    }
    fn configure(&mut self, _data: Value) -> Result<(), BundleError> {
        Ok(())
    }
    /// Generic fallback for commands without a dedicated hook. May return
    /// a payload for correlated commands.
    fn handle_command(&mut self, _command: &str, _data: Value) -> Result<Option<Value>, BundleError> {
        Ok(None)
    }
    fn on_ui_event(&mut self, _event: Value) {}
    fn cleanup(&mut self) -> Result<(), BundleError> {
        Ok(())
    }
}

/// Resolves dependencies and instantiates bundles. The host supplies one
/// loader for the whole runtime.
pub trait BundleLoader: Send + Sync {
    /// Whether a declared dependency (external or internal) is available.
    fn has_dependency(&self, name: &str) -> bool;

    /// Load and execute the bundle, invoking its factory with the app's
    /// identity, manifest, and host proxy handle.
    fn instantiate(
        &self,
        app_id: &AppId,
        manifest: &AppManifest,
        host: HostApi,
    ) -> Result<Box<dyn AppBundle>, BundleError>;
}

type PendingMap = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Result<Value, String>>>>>;

/// Per-context proxy handed to the bundle. Cloneable; every outbound call
/// emits a correlated message and suspends the calling task until the
/// response or the 30 s timeout, whichever is first.
#[derive(Clone)]
pub struct HostApi {
    app_id: AppId,
    outbound: mpsc::UnboundedSender<AppMessage>,
    pending: PendingMap,
}

impl HostApi {
    /// Make one outbound call through the gateway and await its result.
    pub async fn call(&self, request: OutboundRequest) -> Result<Value, String> {
        let request_id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(request_id, tx);

        if self
            .outbound
            .send(AppMessage::ApiCall {
                request_id,
                request,
            })
            .is_err()
        {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&request_id);
            return Err("context is disconnected from the host".to_string());
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a response (context shut down).
                Err("call abandoned by the host".to_string())
            }
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&request_id);
                Err("call timed out after 30s".to_string())
            }
        }
    }

    pub async fn get_data(&self, key: &str) -> Result<Value, String> {
        self.call(OutboundRequest::get(format!("/api/data/{key}")))
            .await
    }

    pub async fn set_data(&self, key: &str, value: Value) -> Result<Value, String> {
        let mut request = OutboundRequest::get(format!("/api/data/{key}"));
        request.method = "PUT".to_string();
        request.body = Some(value);
        self.call(request).await
    }

    /// Push a UI mutation toward the host. Fire-and-forget.
    pub fn update_ui(&self, payload: Value) {
        let _ = self.outbound.send(AppMessage::UiUpdate { payload });
    }

    /// Emit an app log line toward the host. Fire-and-forget.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) {
        let _ = self.outbound.send(AppMessage::Log {
            level,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        });
    }

    #[must_use]
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }
}

/// Handle the supervisor keeps for one spawned context.
pub struct ContextHandle {
    inbound: mpsc::UnboundedSender<HostMessage>,
    task: tokio::task::JoinHandle<()>,
    app_id: AppId,
}

impl ContextHandle {
    /// Deliver a message to the context.
    pub fn send(&self, message: HostMessage) -> Result<(), RuntimeError> {
        self.inbound
            .send(message)
            .map_err(|_| RuntimeError::ContextTerminated(self.app_id.clone()))
    }

    /// Hard-stop the context task. Used when a shutdown message cannot be
    /// delivered or the handshake failed.
    pub fn terminate(&self) {
        self.task.abort();
    }
}

/// Spawn a fresh execution context for `app_id`.
///
/// `outbound` carries every message the context (and its bundle, via
/// [`HostApi`]) sends back toward the supervisor.
#[must_use]
pub fn spawn_context(
    app_id: AppId,
    loader: Arc<dyn BundleLoader>,
    outbound: mpsc::UnboundedSender<AppMessage>,
) -> ContextHandle {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let worker = ContextWorker {
        app_id: app_id.clone(),
        loader,
        outbound,
        pending: Arc::new(Mutex::new(HashMap::new())),
        initialized: false,
        bundle: None,
    };
    let task = tokio::spawn(worker.run(inbound_rx));
    ContextHandle {
        inbound: inbound_tx,
        task,
        app_id,
    }
}

struct ContextWorker {
    app_id: AppId,
    loader: Arc<dyn BundleLoader>,
    outbound: mpsc::UnboundedSender<AppMessage>,
    pending: PendingMap,
    initialized: bool,
    bundle: Option<Box<dyn AppBundle>>,
}

impl ContextWorker {
    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<HostMessage>) {
        while let Some(message) = inbound.recv().await {
            match message {
                HostMessage::InitApp { app_id, manifest } => self.init(&app_id, &manifest),
                HostMessage::UiEvent { event } => self.dispatch_ui_event(event),
                HostMessage::AppCommand {
                    command,
                    data,
                    request_id,
                } => self.dispatch_command(&command, data, request_id),
                HostMessage::ResourceUpdate { usage } => {
                    if let Some(bundle) = self.bundle.as_mut() {
                        let payload = serde_json::to_value(usage).unwrap_or(Value::Null);
                        if let Err(e) = bundle.handle_command("resourceUpdate", payload) {
                            tracing::debug!(app_id = %self.app_id, error = %e, "resource update ignored");
                        }
                    }
                }
                HostMessage::ApiResponse { request_id, result } => {
                    let waiter = self
                        .pending
                        .lock()
                        .expect("pending map poisoned")
                        .remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => tracing::debug!(
                            app_id = %self.app_id,
                            %request_id,
                            "response arrived after its call timed out"
                        ),
                    }
                }
                HostMessage::Shutdown => {
                    self.shutdown();
                    break;
                }
                HostMessage::Custom { message_type, .. } => {
                    tracing::debug!(
                        app_id = %self.app_id,
                        message_type = %message_type,
                        "unrecognized host message ignored"
                    );
                }
            }
        }
        // Dropping the pending map's senders wakes any in-flight callers
        // with an abandonment error.
        self.pending.lock().expect("pending map poisoned").clear();
    }

    /// Initialization handshake: dependencies, bundle load, factory call.
    /// Any failure emits `APP_ERROR` and leaves the context uninitialized.
    fn init(&mut self, app_id: &AppId, manifest: &AppManifest) {
        if self.initialized {
            tracing::warn!(app_id = %self.app_id, "duplicate INIT_APP ignored");
            return;
        }

        for dependency in &manifest.dependencies {
            if self.loader.has_dependency(&dependency.name) {
                continue;
            }
            if dependency.required {
                self.emit_error(format!(
                    "required dependency '{}' is not available",
                    dependency.name
                ));
                return;
            }
            tracing::warn!(
                app_id = %self.app_id,
                dependency = %dependency.name,
                "optional dependency missing"
            );
        }

        let host = HostApi {
            app_id: self.app_id.clone(),
            outbound: self.outbound.clone(),
            pending: Arc::clone(&self.pending),
        };
        match self.loader.instantiate(app_id, manifest, host) {
            Ok(bundle) => {
                self.bundle = Some(bundle);
                self.initialized = true;
                let _ = self.outbound.send(AppMessage::AppReady {
                    app_id: self.app_id.clone(),
                });
            }
            Err(e) => self.emit_error(e.to_string()),
        }
    }

    fn dispatch_ui_event(&mut self, event: Value) {
        if !self.initialized {
            tracing::debug!(app_id = %self.app_id, "UI event dropped before initialization");
            return;
        }
        if let Some(bundle) = self.bundle.as_mut() {
            bundle.on_ui_event(event);
        }
    }

    fn dispatch_command(&mut self, command: &str, data: Value, request_id: Option<CorrelationId>) {
        if !self.initialized {
            tracing::debug!(
                app_id = %self.app_id,
                command = %command,
                "command dropped before initialization"
            );
            return;
        }
        let Some(bundle) = self.bundle.as_mut() else {
            return;
        };

        let result = match command {
            "start" => bundle.start().map(|()| None),
            "stop" => bundle.stop().map(|()| None),
            "pause" => bundle.pause().map(|()| None),
            "resume" => bundle.resume().map(|()| None),
            "configure" => bundle.configure(data).map(|()| None),
            other => bundle.handle_command(other, data),
        };

        match result {
            Ok(payload) => {
                // A handler that produced no payload sends no reply; a
                // correlated caller is released by its own timeout.
                if let (Some(request_id), Some(payload)) = (request_id, payload) {
                    let _ = self.outbound.send(AppMessage::Other {
                        message_type: "COMMAND_RESULT".to_string(),
                        payload,
                        request_id: Some(request_id),
                    });
                }
            }
            Err(e) => {
                tracing::warn!(app_id = %self.app_id, command = %command, error = %e, "command hook failed");
                if let Some(request_id) = request_id {
                    let _ = self.outbound.send(AppMessage::Other {
                        message_type: "COMMAND_RESULT".to_string(),
                        payload: json!({"error": e.to_string()}),
                        request_id: Some(request_id),
                    });
                }
                self.emit_error(e.to_string());
            }
        }
    }

    /// Shutdown is irrecoverable: run cleanup, clear the instance, end.
    fn shutdown(&mut self) {
        if let Some(mut bundle) = self.bundle.take() {
            if let Err(e) = bundle.cleanup() {
                let _ = self.outbound.send(AppMessage::Other {
                    message_type: "CLEANUP_ERROR".to_string(),
                    payload: json!({"error": e.to_string()}),
                    request_id: None,
                });
            }
        }
        tracing::debug!(app_id = %self.app_id, "context terminated");
    }

    fn emit_error(&self, error: String) {
        let _ = self.outbound.send(AppMessage::AppError {
            app_id: self.app_id.clone(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use appdock_types::DependencySpec;

    /// Bundle that records every hook invocation.
    struct RecordingBundle {
        log: Arc<Mutex<Vec<String>>>,
        fail_command: Option<String>,
    }

    impl AppBundle for RecordingBundle {
        fn start(&mut self) -> Result<(), BundleError> {
            self.log.lock().unwrap().push("start".to_string());
            Ok(())
        }
        fn stop(&mut self) -> Result<(), BundleError> {
            self.log.lock().unwrap().push("stop".to_string());
            Ok(())
        }
        fn handle_command(&mut self, command: &str, data: Value) -> Result<Option<Value>, BundleError> {
            if self.fail_command.as_deref() == Some(command) {
                return Err(BundleError::HookFailed {
                    hook: "handle_command",
                    reason: format!("cannot {command}"),
                });
            }
            self.log.lock().unwrap().push(format!("command:{command}"));
            Ok(Some(json!({"echo": data})))
        }
        fn on_ui_event(&mut self, event: Value) {
            self.log.lock().unwrap().push(format!("ui:{event}"));
        }
        fn cleanup(&mut self) -> Result<(), BundleError> {
            self.log.lock().unwrap().push("cleanup".to_string());
            Ok(())
        }
    }

    struct TestLoader {
        log: Arc<Mutex<Vec<String>>>,
        available: Vec<String>,
        fail_command: Option<String>,
    }

    impl BundleLoader for TestLoader {
        fn has_dependency(&self, name: &str) -> bool {
            self.available.iter().any(|d| d == name)
        }
        fn instantiate(
            &self,
            _app_id: &AppId,
            _manifest: &AppManifest,
            _host: HostApi,
        ) -> Result<Box<dyn AppBundle>, BundleError> {
            Ok(Box::new(RecordingBundle {
                log: Arc::clone(&self.log),
                fail_command: self.fail_command.clone(),
            }))
        }
    }

    struct Harness {
        handle: ContextHandle,
        outbound: mpsc::UnboundedReceiver<AppMessage>,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn harness(available: Vec<String>, fail_command: Option<String>) -> Harness {
        let log = Arc::new(Mutex::new(Vec::new()));
        let loader = Arc::new(TestLoader {
            log: Arc::clone(&log),
            available,
            fail_command,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_context(AppId::from("ctx"), loader, tx);
        Harness {
            handle,
            outbound: rx,
            log,
        }
    }

    fn init_message(dependencies: Vec<DependencySpec>) -> HostMessage {
        HostMessage::InitApp {
            app_id: AppId::from("ctx"),
            manifest: AppManifest {
                name: "ctx".to_string(),
                dependencies,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn handshake_emits_ready_and_enables_dispatch() {
        let mut h = harness(vec![], None);

        // pre-init traffic is dropped, not dispatched
        h.handle
            .send(HostMessage::UiEvent { event: json!(1) })
            .unwrap();
        h.handle.send(init_message(vec![])).unwrap();

        assert!(matches!(
            h.outbound.recv().await,
            Some(AppMessage::AppReady { .. })
        ));

        h.handle
            .send(HostMessage::UiEvent { event: json!(2) })
            .unwrap();
        h.handle
            .send(HostMessage::AppCommand {
                command: "start".to_string(),
                data: Value::Null,
                request_id: None,
            })
            .unwrap();
        tokio::task::yield_now().await;

        let recorded = h.log.lock().unwrap().clone();
        assert_eq!(recorded, vec!["ui:2".to_string(), "start".to_string()]);
    }

    #[tokio::test]
    async fn missing_required_dependency_fails_the_handshake() {
        let mut h = harness(vec![], None);
        h.handle
            .send(init_message(vec![DependencySpec {
                name: "charts".to_string(),
                required: true,
            }]))
            .unwrap();

        match h.outbound.recv().await {
            Some(AppMessage::AppError { error, .. }) => assert!(error.contains("charts")),
            other => panic!("expected AppError, got {other:?}"),
        }
        // still uninitialized: commands are dropped
        h.handle
            .send(HostMessage::AppCommand {
                command: "start".to_string(),
                data: Value::Null,
                request_id: None,
            })
            .unwrap();
        tokio::task::yield_now().await;
        assert!(h.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_optional_dependency_only_warns() {
        let mut h = harness(vec![], None);
        h.handle
            .send(init_message(vec![DependencySpec {
                name: "themes".to_string(),
                required: false,
            }]))
            .unwrap();
        assert!(matches!(
            h.outbound.recv().await,
            Some(AppMessage::AppReady { .. })
        ));
    }

    #[tokio::test]
    async fn correlated_command_gets_a_result_message() {
        let mut h = harness(vec![], None);
        h.handle.send(init_message(vec![])).unwrap();
        let _ready = h.outbound.recv().await;

        let request_id = CorrelationId::generate();
        h.handle
            .send(HostMessage::AppCommand {
                command: "refresh".to_string(),
                data: json!({"scope": "all"}),
                request_id: Some(request_id),
            })
            .unwrap();

        match h.outbound.recv().await {
            Some(AppMessage::Other {
                message_type,
                payload,
                request_id: Some(id),
            }) => {
                assert_eq!(message_type, "COMMAND_RESULT");
                assert_eq!(id, request_id);
                assert_eq!(payload["echo"]["scope"], "all");
            }
            other => panic!("expected COMMAND_RESULT, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_hook_reports_an_app_error() {
        let mut h = harness(vec![], Some("explode".to_string()));
        h.handle.send(init_message(vec![])).unwrap();
        let _ready = h.outbound.recv().await;

        h.handle
            .send(HostMessage::AppCommand {
                command: "explode".to_string(),
                data: Value::Null,
                request_id: None,
            })
            .unwrap();

        match h.outbound.recv().await {
            Some(AppMessage::AppError { error, .. }) => assert!(error.contains("explode")),
            other => panic!("expected AppError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_runs_cleanup_and_terminates() {
        let mut h = harness(vec![], None);
        h.handle.send(init_message(vec![])).unwrap();
        let _ready = h.outbound.recv().await;

        h.handle.send(HostMessage::Shutdown).unwrap();
        tokio::task::yield_now().await;
        // give the task a moment to drain and exit
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while h.handle.send(HostMessage::UiEvent { event: json!(0) }).is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await;

        assert!(h.log.lock().unwrap().contains(&"cleanup".to_string()));
        assert!(h
            .handle
            .send(HostMessage::UiEvent { event: json!(0) })
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn host_api_call_round_trip_and_timeout() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let host = HostApi {
            app_id: AppId::from("ctx"),
            outbound: outbound_tx,
            pending: Arc::clone(&pending),
        };

        // round trip: a responder resolves the pending entry, then hands
        // the receiver back so the channel stays open afterwards
        let responder_pending = Arc::clone(&pending);
        let responder = tokio::spawn(async move {
            if let Some(AppMessage::ApiCall { request_id, .. }) = outbound_rx.recv().await {
                let tx = responder_pending
                    .lock()
                    .unwrap()
                    .remove(&request_id)
                    .expect("pending entry exists");
                tx.send(Ok(json!({"answer": 42}))).unwrap();
            }
            outbound_rx
        });
        let value = host
            .call(OutboundRequest::get("/api/data/x"))
            .await
            .expect("call resolves");
        assert_eq!(value["answer"], 42);
        let _outbound_rx = responder.await.unwrap();

        // timeout: the channel is open but nobody responds; the entry is
        // cleaned up when the call gives up
        let result = host.call(OutboundRequest::get("/api/data/y")).await;
        assert!(result.unwrap_err().contains("timed out"));
        assert!(pending.lock().unwrap().is_empty());
    }
}
