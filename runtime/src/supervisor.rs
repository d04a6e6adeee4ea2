//! Instance supervisor: owns the registry of live app instances and
//! drives their lifecycle.
//!
//! The supervisor is the only writer of instance records. Each loaded app
//! gets its own execution context task and its own router task; a fault
//! or stall in one app suspends only that app's tasks, never the
//! supervisor's control plane or another app.
//!
//! Two periodic sweeps run for the supervisor's lifetime: usage
//! resampling (seconds) and inactivity reaping of paused instances (tens
//! of minutes). Both take the registry lock per step, so a concurrent
//! lifecycle call always observes a consistent instance record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use appdock_types::{
    AppId, AppManifest, AppMessage, CorrelationId, HostMessage, InstanceSnapshot, InstanceState,
    RuntimeError, RuntimeStats, UsageSample,
};

use crate::config::RuntimeConfig;
use crate::context::{BundleLoader, ContextHandle, spawn_context};
use crate::events::{EventBus, HostEvent};
use crate::executor::CallExecutor;
use crate::gateway::Gateway;
use crate::permissions::PermissionEngine;
use crate::quota::QuotaTracker;

/// One registry entry. Owned exclusively by the supervisor; the execution
/// context holds no authoritative copy.
struct Instance {
    state: InstanceState,
    manifest: AppManifest,
    context: ContextHandle,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_activity_mono: Instant,
}

impl Instance {
    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_activity_mono = Instant::now();
    }
}

type HandshakeSlot = Arc<StdMutex<Option<oneshot::Sender<Result<(), String>>>>>;

struct SupervisorInner {
    config: RuntimeConfig,
    permissions: Arc<PermissionEngine>,
    quotas: Arc<QuotaTracker>,
    gateway: Arc<Gateway>,
    loader: Arc<dyn BundleLoader>,
    events: EventBus,
    instances: Mutex<HashMap<AppId, Instance>>,
    /// Host-to-context correlations awaiting a response, keyed by
    /// correlation id and tagged with the owning app for unload cleanup.
    pending: StdMutex<HashMap<CorrelationId, (AppId, oneshot::Sender<Value>)>>,
}

/// Supervises every loaded app instance.
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    sweeps: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    /// Build a supervisor and start its periodic sweeps.
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        loader: Arc<dyn BundleLoader>,
        executor: Arc<dyn CallExecutor>,
    ) -> Self {
        let permissions = Arc::new(PermissionEngine::new());
        let quotas = Arc::new(QuotaTracker::new());
        let gateway = Arc::new(Gateway::new(
            config.gateway.clone(),
            Arc::clone(&permissions),
            Arc::clone(&quotas),
            executor,
        ));
        let inner = Arc::new(SupervisorInner {
            config,
            permissions,
            quotas,
            gateway,
            loader,
            events: EventBus::new(),
            instances: Mutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
        });

        let usage_sweep = tokio::spawn(usage_sweep(Arc::clone(&inner)));
        let reap_sweep = tokio::spawn(reap_sweep(Arc::clone(&inner)));
        Self {
            inner,
            sweeps: StdMutex::new(vec![usage_sweep, reap_sweep]),
        }
    }

    /// Subscribe to host-level notifications.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Load an app: validate, register grants and quotas, spawn its
    /// context, and run the initialization handshake. On failure every
    /// registration is rolled back and the context is torn down.
    pub async fn load(&self, app_id: AppId, manifest: AppManifest) -> Result<(), RuntimeError> {
        let inner = &self.inner;

        let errors = manifest.validate();
        if !errors.is_empty() {
            return Err(RuntimeError::InvalidManifest(errors));
        }
        inner
            .permissions
            .register_app(&app_id, &manifest.permissions, &manifest.security)?;
        inner.quotas.register_app(&app_id, manifest.resources);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handshake: HandshakeSlot = Arc::new(StdMutex::new(Some(ready_tx)));

        // Reserve the registry slot before spawning anything so concurrent
        // loads of the same id cannot race past the checks.
        {
            let mut instances = inner.instances.lock().await;
            if instances.contains_key(&app_id) {
                inner.permissions.unregister_app(&app_id);
                inner.quotas.unregister_app(&app_id);
                return Err(RuntimeError::AlreadyLoaded(app_id));
            }
            if instances.len() >= inner.config.max_apps {
                inner.permissions.unregister_app(&app_id);
                inner.quotas.unregister_app(&app_id);
                return Err(RuntimeError::CapacityExceeded {
                    max: inner.config.max_apps,
                });
            }

            let context = spawn_context(app_id.clone(), Arc::clone(&inner.loader), outbound_tx);
            tokio::spawn(route_app_messages(
                Arc::clone(inner),
                app_id.clone(),
                outbound_rx,
                Arc::clone(&handshake),
            ));
            instances.insert(
                app_id.clone(),
                Instance {
                    state: InstanceState::Loading,
                    manifest: manifest.clone(),
                    context,
                    started_at: Utc::now(),
                    last_activity: Utc::now(),
                    last_activity_mono: Instant::now(),
                },
            );
        }

        let handshake_result = {
            let instances = inner.instances.lock().await;
            let instance = instances.get(&app_id).expect("just inserted");
            instance.context.send(HostMessage::InitApp {
                app_id: app_id.clone(),
                manifest,
            })
        };
        if let Err(e) = handshake_result {
            self.rollback_load(&app_id).await;
            return Err(e);
        }

        match tokio::time::timeout(inner.config.handshake_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                let mut instances = inner.instances.lock().await;
                if let Some(instance) = instances.get_mut(&app_id) {
                    instance.state = InstanceState::Paused;
                    instance.touch();
                }
                tracing::info!(app_id = %app_id, "app loaded");
                Ok(())
            }
            Ok(Ok(Err(reason))) => {
                self.rollback_load(&app_id).await;
                Err(RuntimeError::InitFailed { app_id, reason })
            }
            Ok(Err(_)) => {
                // Router dropped the handshake sender: context died.
                self.rollback_load(&app_id).await;
                Err(RuntimeError::InitFailed {
                    app_id,
                    reason: "context terminated during handshake".to_string(),
                })
            }
            Err(_) => {
                self.rollback_load(&app_id).await;
                Err(RuntimeError::InitTimeout(app_id))
            }
        }
    }

    async fn rollback_load(&self, app_id: &AppId) {
        let inner = &self.inner;
        if let Some(instance) = inner.instances.lock().await.remove(app_id) {
            instance.context.terminate();
        }
        inner.permissions.unregister_app(app_id);
        inner.quotas.unregister_app(app_id);
        inner.gateway.remove_app(app_id);
        self.drop_pending(app_id);
    }

    /// Move a paused app to running. No-op when already running; refused
    /// while the quota tracker says the app should be suspended, and
    /// refused from `loading` or `error`.
    pub async fn start(&self, app_id: &AppId) -> Result<(), RuntimeError> {
        self.run_transition(app_id, "start", true).await
    }

    /// Same gate and transition as `start` from `paused`; a no-op from
    /// every other state.
    pub async fn resume(&self, app_id: &AppId) -> Result<(), RuntimeError> {
        self.run_transition(app_id, "resume", false).await
    }

    async fn run_transition(
        &self,
        app_id: &AppId,
        command: &'static str,
        strict: bool,
    ) -> Result<(), RuntimeError> {
        let mut instances = self.inner.instances.lock().await;
        let instance = instances
            .get_mut(app_id)
            .ok_or_else(|| RuntimeError::NotLoaded(app_id.clone()))?;
        match instance.state {
            InstanceState::Running => Ok(()),
            InstanceState::Paused => {
                if self.inner.quotas.should_suspend(app_id) {
                    return Err(RuntimeError::Suspended(app_id.clone()));
                }
                instance.context.send(HostMessage::AppCommand {
                    command: command.to_string(),
                    data: Value::Null,
                    request_id: None,
                })?;
                instance.state = InstanceState::Running;
                instance.touch();
                tracing::debug!(app_id = %app_id, command, "app running");
                Ok(())
            }
            state if strict => Err(RuntimeError::InvalidState {
                app_id: app_id.clone(),
                state,
                op: command,
            }),
            _ => Ok(()),
        }
    }

    /// Move a running app to paused. No-op otherwise.
    pub async fn stop(&self, app_id: &AppId) -> Result<(), RuntimeError> {
        self.halt_transition(app_id, "stop").await
    }

    /// Same transition as `stop`; the bundle sees a different command.
    pub async fn pause(&self, app_id: &AppId) -> Result<(), RuntimeError> {
        self.halt_transition(app_id, "pause").await
    }

    async fn halt_transition(&self, app_id: &AppId, command: &'static str) -> Result<(), RuntimeError> {
        let mut instances = self.inner.instances.lock().await;
        let instance = instances
            .get_mut(app_id)
            .ok_or_else(|| RuntimeError::NotLoaded(app_id.clone()))?;
        if instance.state != InstanceState::Running {
            return Ok(());
        }
        instance.context.send(HostMessage::AppCommand {
            command: command.to_string(),
            data: Value::Null,
            request_id: None,
        })?;
        instance.state = InstanceState::Paused;
        instance.touch();
        Ok(())
    }

    /// Unload from any state: stop if running, shut the context down, and
    /// erase every trace of the app across all components.
    pub async fn unload(&self, app_id: &AppId) -> Result<(), RuntimeError> {
        let instance = {
            let mut instances = self.inner.instances.lock().await;
            instances
                .remove(app_id)
                .ok_or_else(|| RuntimeError::NotLoaded(app_id.clone()))?
        };

        if instance.state == InstanceState::Running {
            let _ = instance.context.send(HostMessage::AppCommand {
                command: "stop".to_string(),
                data: Value::Null,
                request_id: None,
            });
        }
        if instance.context.send(HostMessage::Shutdown).is_err() {
            // Context already gone; make sure the task is too.
            instance.context.terminate();
        }

        self.inner.permissions.unregister_app(app_id);
        self.inner.quotas.unregister_app(app_id);
        self.inner.gateway.remove_app(app_id);
        self.drop_pending(app_id);
        tracing::info!(app_id = %app_id, "app unloaded");
        Ok(())
    }

    /// Unload every app. Intended for host shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<AppId> = {
            let instances = self.inner.instances.lock().await;
            instances.keys().cloned().collect()
        };
        for app_id in ids {
            let _ = self.unload(&app_id).await;
        }
    }

    /// Send a correlated message to an app and await its response, up to
    /// the fixed correlation timeout.
    pub async fn send_message(
        &self,
        app_id: &AppId,
        message_type: &str,
        payload: Value,
    ) -> Result<Value, RuntimeError> {
        let request_id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending correlations poisoned")
            .insert(request_id, (app_id.clone(), tx));

        let send_result = {
            let instances = self.inner.instances.lock().await;
            match instances.get(app_id) {
                Some(instance) => instance.context.send(HostMessage::AppCommand {
                    command: message_type.to_string(),
                    data: payload,
                    request_id: Some(request_id),
                }),
                None => Err(RuntimeError::NotLoaded(app_id.clone())),
            }
        };
        if let Err(e) = send_result {
            self.remove_pending(request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.call_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RuntimeError::ContextTerminated(app_id.clone())),
            Err(_) => {
                self.remove_pending(request_id);
                Err(RuntimeError::ResponseTimeout(app_id.clone()))
            }
        }
    }

    /// Forward a UI event to an app's context.
    pub async fn send_ui_event(&self, app_id: &AppId, event: Value) -> Result<(), RuntimeError> {
        let instances = self.inner.instances.lock().await;
        let instance = instances
            .get(app_id)
            .ok_or_else(|| RuntimeError::NotLoaded(app_id.clone()))?;
        instance.context.send(HostMessage::UiEvent { event })
    }

    /// Read-only snapshot of one instance.
    pub async fn instance(&self, app_id: &AppId) -> Option<InstanceSnapshot> {
        let instances = self.inner.instances.lock().await;
        instances.get(app_id).map(|instance| InstanceSnapshot {
            app_id: app_id.clone(),
            name: instance.manifest.name.clone(),
            state: instance.state,
            started_at: instance.started_at,
            last_activity: instance.last_activity,
            usage: self.inner.quotas.latest_sample(app_id),
        })
    }

    /// Aggregate counts and usage across all live instances.
    pub async fn runtime_stats(&self) -> RuntimeStats {
        let instances = self.inner.instances.lock().await;
        let mut stats = RuntimeStats {
            total_apps: instances.len(),
            ..Default::default()
        };
        for (app_id, instance) in instances.iter() {
            match instance.state {
                InstanceState::Loading => stats.loading += 1,
                InstanceState::Running => stats.running += 1,
                InstanceState::Paused => stats.paused += 1,
                InstanceState::Error => stats.errored += 1,
            }
            if let Some(sample) = self.inner.quotas.latest_sample(app_id) {
                stats.total_memory += sample.memory;
                stats.total_api_calls += sample.api_calls;
            }
        }
        stats
    }

    /// The gateway, for metrics and statistics queries.
    #[must_use]
    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    /// The quota tracker, for violation queries and operator overrides.
    #[must_use]
    pub fn quotas(&self) -> &QuotaTracker {
        &self.inner.quotas
    }

    /// The permission engine, for audit queries.
    #[must_use]
    pub fn permissions(&self) -> &PermissionEngine {
        &self.inner.permissions
    }

    fn drop_pending(&self, app_id: &AppId) {
        self.inner
            .pending
            .lock()
            .expect("pending correlations poisoned")
            .retain(|_, (owner, _)| owner != app_id);
    }

    fn remove_pending(&self, request_id: CorrelationId) {
        self.inner
            .pending
            .lock()
            .expect("pending correlations poisoned")
            .remove(&request_id);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for sweep in self.sweeps.lock().expect("sweep handles poisoned").drain(..) {
            sweep.abort();
        }
    }
}

/// Per-app router: demultiplexes everything the context sends back.
/// Runs until the context's outbound channel closes.
async fn route_app_messages(
    inner: Arc<SupervisorInner>,
    app_id: AppId,
    mut outbound: mpsc::UnboundedReceiver<AppMessage>,
    handshake: HandshakeSlot,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            AppMessage::ApiCall {
                request_id,
                request,
            } => {
                // Suspends only this app's router; other apps route freely.
                let outcome = inner.gateway.proxy(&app_id, request).await;
                let result = outcome.into_result();
                let instances = inner.instances.lock().await;
                if let Some(instance) = instances.get(&app_id) {
                    let _ = instance
                        .context
                        .send(HostMessage::ApiResponse { request_id, result });
                }
            }
            AppMessage::UiUpdate { payload } => {
                touch(&inner, &app_id).await;
                inner.events.emit(HostEvent::UiUpdate {
                    app_id: app_id.clone(),
                    payload,
                });
            }
            AppMessage::Log {
                level,
                message,
                data,
                timestamp,
            } => {
                inner.events.emit(HostEvent::AppLog {
                    app_id: app_id.clone(),
                    level,
                    message,
                    data,
                    timestamp,
                });
            }
            AppMessage::AppReady { .. } => {
                let waiter = handshake.lock().expect("handshake slot poisoned").take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => tracing::debug!(app_id = %app_id, "late APP_READY ignored"),
                }
            }
            AppMessage::AppError { error, .. } => {
                let waiter = handshake.lock().expect("handshake slot poisoned").take();
                if let Some(tx) = waiter {
                    let _ = tx.send(Err(error));
                    continue;
                }
                // Runtime fault after initialization: isolate to this app.
                tracing::warn!(app_id = %app_id, error = %error, "app fault");
                {
                    let mut instances = inner.instances.lock().await;
                    if let Some(instance) = instances.get_mut(&app_id) {
                        instance.state = InstanceState::Error;
                        instance.touch();
                    }
                }
                inner.events.emit(HostEvent::AppError {
                    app_id: app_id.clone(),
                    error,
                });
            }
            AppMessage::Other {
                message_type,
                payload,
                request_id,
            } => {
                if message_type == "CLEANUP_ERROR" {
                    let error = payload["error"].as_str().unwrap_or("cleanup failed");
                    inner.events.emit(HostEvent::CleanupError {
                        app_id: app_id.clone(),
                        error: error.to_string(),
                    });
                    continue;
                }
                let waiter = request_id.and_then(|id| {
                    inner
                        .pending
                        .lock()
                        .expect("pending correlations poisoned")
                        .remove(&id)
                });
                match waiter {
                    Some((_, tx)) => {
                        let _ = tx.send(payload);
                    }
                    None => {
                        touch(&inner, &app_id).await;
                        inner.events.emit(HostEvent::AppMessage {
                            app_id: app_id.clone(),
                            message_type,
                            payload,
                        });
                    }
                }
            }
        }
    }

    // Channel closed. If the instance still exists the context died
    // underneath it rather than through unload.
    let crashed = {
        let mut instances = inner.instances.lock().await;
        match instances.get_mut(&app_id) {
            Some(instance) => {
                instance.state = InstanceState::Error;
                true
            }
            None => false,
        }
    };
    if crashed {
        inner.events.emit(HostEvent::WorkerError {
            app_id: app_id.clone(),
            error: "execution context terminated unexpectedly".to_string(),
        });
    }
}

async fn touch(inner: &SupervisorInner, app_id: &AppId) {
    let mut instances = inner.instances.lock().await;
    if let Some(instance) = instances.get_mut(app_id) {
        instance.touch();
    }
}

/// Synthetic usage resampling for every live instance: carries the latest
/// counters forward with a fresh timestamp so limits are re-evaluated and
/// the context sees its own usage.
async fn usage_sweep(inner: Arc<SupervisorInner>) {
    let mut ticker = tokio::time::interval(inner.config.usage_sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let ids: Vec<AppId> = {
            let instances = inner.instances.lock().await;
            instances.keys().cloned().collect()
        };
        for app_id in ids {
            let mut sample = inner
                .quotas
                .latest_sample(&app_id)
                .unwrap_or_else(UsageSample::empty);
            sample.at = Utc::now();
            let _ = inner.quotas.track_usage(&app_id, sample);

            let instances = inner.instances.lock().await;
            if let Some(instance) = instances.get(&app_id) {
                let _ = instance
                    .context
                    .send(HostMessage::ResourceUpdate { usage: sample });
            }
        }
    }
}

/// Reaps instances paused and inactive beyond the configured threshold,
/// and drives the quota tracker's 24-hour pruning.
async fn reap_sweep(inner: Arc<SupervisorInner>) {
    // A zero-duration interval panics; hosts may configure a tiny (or
    // zero) inactivity timeout.
    let tick = (inner.config.inactivity_timeout / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        inner.quotas.prune_expired();

        let now = Instant::now();
        let stale: Vec<AppId> = {
            let instances = inner.instances.lock().await;
            instances
                .iter()
                .filter(|(_, instance)| {
                    instance.state == InstanceState::Paused
                        && now.saturating_duration_since(instance.last_activity_mono)
                            > inner.config.inactivity_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for app_id in stale {
            tracing::info!(app_id = %app_id, "reaping inactive app");
            let instance = {
                let mut instances = inner.instances.lock().await;
                instances.remove(&app_id)
            };
            if let Some(instance) = instance {
                if instance.context.send(HostMessage::Shutdown).is_err() {
                    instance.context.terminate();
                }
                inner.permissions.unregister_app(&app_id);
                inner.quotas.unregister_app(&app_id);
                inner.gateway.remove_app(&app_id);
                inner
                    .pending
                    .lock()
                    .expect("pending correlations poisoned")
                    .retain(|_, (owner, _)| owner != &app_id);
            }
        }
    }
}
