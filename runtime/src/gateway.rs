//! Outbound call gateway: the only path from a sandboxed context to the
//! outside world.
//!
//! Pipeline per call: permission check, rate-limit window, quota point
//! check, request shaping, execution with bounded retry, metric capture.
//! `proxy` always resolves to a [`CallOutcome`] — policy denials and
//! exhausted retries are values, never errors thrown past this boundary.
//!
//! All per-app state (rate windows) is partitioned by app id; one app
//! exhausting its window cannot affect another's.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use appdock_types::{AppId, CorrelationId, GrantType, OutboundRequest, ResourceKind};

use crate::config::GatewayConfig;
use crate::executor::{CallError, CallExecutor, CallResponse, ShapedRequest};
use crate::permissions::PermissionEngine;
use crate::quota::QuotaTracker;

/// Metrics ring capacity across all apps; oldest entries are trimmed.
const METRICS_CAP: usize = 10_000;

/// Which policy stage refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialStage {
    Permission,
    RateLimit,
    Quota,
}

/// Structured result of a proxied call.
#[derive(Debug)]
pub enum CallOutcome {
    /// The call executed and succeeded.
    Success(CallResponse),
    /// A policy stage refused the call before execution.
    Denied { stage: DenialStage, reason: String },
    /// Execution failed after exhausting retries.
    Failed { attempts: u32, error: CallError },
}

impl CallOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Flatten into the payload the context's caller receives.
    #[must_use]
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        match self {
            Self::Success(response) => Ok(response.body),
            Self::Denied { reason, .. } => Err(reason),
            Self::Failed { attempts, error } => {
                Err(format!("call failed after {attempts} attempts: {error}"))
            }
        }
    }
}

/// One live rate-limit window. Replaced, not mutated, on expiry.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    ends: Instant,
}

impl RateWindow {
    fn fresh(now: Instant, duration: Duration) -> Self {
        Self {
            count: 0,
            ends: now + duration,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.ends
    }
}

/// One completed (or failed) outbound call, for statistics and audit.
/// Never consulted for control decisions.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub app_id: AppId,
    pub endpoint: String,
    pub method: String,
    pub duration: Duration,
    pub success: bool,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub bytes: u64,
    pub at: DateTime<Utc>,
}

/// Aggregate over the metrics ring.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub total_bytes: u64,
}

/// Mediates every outbound call a sandboxed app makes.
pub struct Gateway {
    config: GatewayConfig,
    permissions: Arc<PermissionEngine>,
    quotas: Arc<QuotaTracker>,
    executor: Arc<dyn CallExecutor>,
    windows: Mutex<HashMap<AppId, RateWindow>>,
    metrics: Mutex<VecDeque<RequestMetric>>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        permissions: Arc<PermissionEngine>,
        quotas: Arc<QuotaTracker>,
        executor: Arc<dyn CallExecutor>,
    ) -> Self {
        Self {
            config,
            permissions,
            quotas,
            executor,
            windows: Mutex::new(HashMap::new()),
            metrics: Mutex::new(VecDeque::new()),
        }
    }

    /// Proxy one outbound call. Always resolves; see [`CallOutcome`].
    ///
    /// The permission check evaluates the request's HTTP method as the
    /// action, so a grant listing `actions: ["GET"]` covers GET calls and
    /// nothing else.
    pub async fn proxy(&self, app_id: &AppId, request: OutboundRequest) -> CallOutcome {
        let decision = self.permissions.check(
            app_id,
            GrantType::Api,
            &request.endpoint,
            &request.method,
            &request.context,
        );
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "permission denied".to_string());
            tracing::debug!(app_id = %app_id, endpoint = %request.endpoint, %reason, "call denied");
            return CallOutcome::Denied {
                stage: DenialStage::Permission,
                reason,
            };
        }

        if let Some(reason) = self.check_rate_limit(app_id) {
            return CallOutcome::Denied {
                stage: DenialStage::RateLimit,
                reason,
            };
        }

        if !self.quotas.enforce_limit(app_id, ResourceKind::ApiCalls) {
            return CallOutcome::Denied {
                stage: DenialStage::Quota,
                reason: "apiCalls quota exhausted".to_string(),
            };
        }

        let shaped = self.shape(app_id, request);
        let endpoint = shaped.endpoint.clone();
        let method = shaped.method.clone();
        let started = Instant::now();
        let (outcome, attempts) = self.execute_with_retry(shaped).await;
        let duration = started.elapsed();

        match &outcome {
            Ok(response) => {
                self.record_metric(RequestMetric {
                    app_id: app_id.clone(),
                    endpoint,
                    method,
                    duration,
                    success: true,
                    status: Some(response.status),
                    error: None,
                    bytes: response.bytes,
                    at: Utc::now(),
                });
                self.count_request(app_id);
                self.quotas.record_call(app_id);
            }
            Err(error) => {
                self.record_metric(RequestMetric {
                    app_id: app_id.clone(),
                    endpoint,
                    method,
                    duration,
                    success: false,
                    status: match error {
                        CallError::Status { status } => Some(*status),
                        _ => None,
                    },
                    error: Some(error.to_string()),
                    bytes: 0,
                    at: Utc::now(),
                });
            }
        }

        match outcome {
            Ok(response) => CallOutcome::Success(response),
            Err(error) => CallOutcome::Failed { attempts, error },
        }
    }

    /// Rate-window check. Absent or expired windows are replaced fresh and
    /// allow the call; a full window denies with seconds-to-reset.
    fn check_rate_limit(&self, app_id: &AppId) -> Option<String> {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate windows poisoned");
        let window = windows
            .entry(app_id.clone())
            .or_insert_with(|| RateWindow::fresh(now, self.config.rate_limit_window));
        if window.expired(now) {
            *window = RateWindow::fresh(now, self.config.rate_limit_window);
            return None;
        }
        if window.count >= self.config.max_requests_per_window {
            let reset_secs = window.ends.saturating_duration_since(now).as_secs().max(1);
            return Some(format!(
                "rate limit exceeded ({} per window); resets in {reset_secs}s",
                self.config.max_requests_per_window
            ));
        }
        None
    }

    fn count_request(&self, app_id: &AppId) {
        let mut windows = self.windows.lock().expect("rate windows poisoned");
        if let Some(window) = windows.get_mut(app_id) {
            window.count += 1;
        }
    }

    /// Inject the correlation id and standard headers. Never blocks.
    fn shape(&self, app_id: &AppId, request: OutboundRequest) -> ShapedRequest {
        let correlation_id = CorrelationId::generate();
        let mut headers = request.headers;
        headers.insert("x-appdock-app".to_string(), app_id.to_string());
        headers.insert("x-correlation-id".to_string(), correlation_id.to_string());
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());
        ShapedRequest {
            app_id: app_id.clone(),
            correlation_id,
            endpoint: request.endpoint,
            method: request.method,
            body: request.body,
            headers,
        }
    }

    /// Execute with exponential backoff (`2^attempt` seconds). The final
    /// attempt surfaces the error instead of retrying.
    async fn execute_with_retry(
        &self,
        request: ShapedRequest,
    ) -> (Result<CallResponse, CallError>, u32) {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = CallError::Transport("no attempts configured".to_string());
        for attempt in 0..attempts {
            let fut = self.executor.execute(request.clone());
            let result = match tokio::time::timeout(self.config.call_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(CallError::Timeout),
            };
            match result {
                Ok(response) => return (Ok(response), attempt + 1),
                Err(error) => {
                    if attempt + 1 == attempts {
                        return (Err(error), attempts);
                    }
                    let delay = Duration::from_secs(1u64 << attempt.min(16));
                    tracing::debug!(
                        app_id = %request.app_id,
                        endpoint = %request.endpoint,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "retrying outbound call"
                    );
                    last_error = error;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        (Err(last_error), attempts)
    }

    fn record_metric(&self, metric: RequestMetric) {
        let mut metrics = self.metrics.lock().expect("metrics ring poisoned");
        if metrics.len() >= METRICS_CAP {
            metrics.pop_front();
        }
        metrics.push_back(metric);
    }

    /// Metrics recorded for one app, oldest first.
    #[must_use]
    pub fn metrics_for(&self, app_id: &AppId) -> Vec<RequestMetric> {
        self.metrics
            .lock()
            .expect("metrics ring poisoned")
            .iter()
            .filter(|m| &m.app_id == app_id)
            .cloned()
            .collect()
    }

    /// Aggregate statistics over the whole metrics ring.
    #[must_use]
    pub fn stats(&self) -> RequestStats {
        let metrics = self.metrics.lock().expect("metrics ring poisoned");
        let total = metrics.len();
        if total == 0 {
            return RequestStats::default();
        }
        let succeeded = metrics.iter().filter(|m| m.success).count();
        let total_ms: f64 = metrics.iter().map(|m| m.duration.as_secs_f64() * 1000.0).sum();
        RequestStats {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: succeeded as f64 / total as f64,
            avg_duration_ms: total_ms / total as f64,
            total_bytes: metrics.iter().map(|m| m.bytes).sum(),
        }
    }

    /// Drop the rate window and metrics for an unloaded app.
    pub fn remove_app(&self, app_id: &AppId) {
        self.windows
            .lock()
            .expect("rate windows poisoned")
            .remove(app_id);
        self.metrics
            .lock()
            .expect("metrics ring poisoned")
            .retain(|m| &m.app_id != app_id);
    }
}
