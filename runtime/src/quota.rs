//! Resource quota tracker: usage time series, violation policy, and the
//! suspend/throttle gates the supervisor consults before `start`/`resume`.
//!
//! All state is partitioned by app id. Windows (5-minute violation
//! lookback, 24-hour retention) run on the tokio monotonic clock so paused
//! time in tests drives them deterministically; wall timestamps stay on
//! the records for reporting.
//!
//! No limits configured for an app means every check passes. Fail-open:
//! absence of configuration is not an error condition.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use appdock_types::{AppId, ResourceKind, ResourceLimits, UsageSample};

/// Per-app sample ring capacity.
const SAMPLE_CAP: usize = 1_000;
/// Samples and violations older than this are pruned by the sweep.
const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Lookback for the suspend/throttle lifecycle gates.
const VIOLATION_LOOKBACK: Duration = Duration::from_secs(5 * 60);

/// Severity-derived response to a quota overage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationAction {
    Warning,
    Throttle,
    Suspend,
}

impl ViolationAction {
    /// Tiered policy: ratio > 2.0 suspends, > 1.5 throttles, else warns.
    #[must_use]
    pub fn for_ratio(ratio: f64) -> Self {
        if ratio > 2.0 {
            Self::Suspend
        } else if ratio > 1.5 {
            Self::Throttle
        } else {
            Self::Warning
        }
    }
}

/// One recorded quota overage.
#[derive(Debug, Clone)]
pub struct Violation {
    pub resource: ResourceKind,
    pub limit: f64,
    pub actual: f64,
    pub action: ViolationAction,
    pub at: DateTime<Utc>,
    recorded: Instant,
}

#[derive(Debug)]
struct AppQuota {
    limits: ResourceLimits,
    samples: VecDeque<(Instant, UsageSample)>,
    violations: VecDeque<Violation>,
}

impl AppQuota {
    fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            samples: VecDeque::new(),
            violations: VecDeque::new(),
        }
    }

    fn latest(&self) -> Option<&UsageSample> {
        self.samples.back().map(|(_, sample)| sample)
    }

    fn push_sample(&mut self, now: Instant, sample: UsageSample) -> Vec<Violation> {
        self.samples.push_back((now, sample));
        while self.samples.len() > SAMPLE_CAP {
            self.samples.pop_front();
        }

        let mut fresh = Vec::new();
        for kind in ResourceKind::ALL {
            let Some(limit) = self.limits.limit(kind) else {
                continue;
            };
            if limit <= 0.0 {
                continue;
            }
            let actual = sample.value(kind);
            if actual <= limit {
                continue;
            }
            let violation = Violation {
                resource: kind,
                limit,
                actual,
                action: ViolationAction::for_ratio(actual / limit),
                at: sample.at,
                recorded: now,
            };
            tracing::warn!(
                resource = %kind,
                limit,
                actual,
                action = ?violation.action,
                "quota violation"
            );
            self.violations.push_back(violation.clone());
            fresh.push(violation);
        }
        fresh
    }

    fn has_recent(&self, action: ViolationAction, now: Instant) -> bool {
        self.violations.iter().any(|v| {
            v.action == action && now.saturating_duration_since(v.recorded) < VIOLATION_LOOKBACK
        })
    }

    fn prune(&mut self, now: Instant) {
        self.samples
            .retain(|(at, _)| now.saturating_duration_since(*at) < RETENTION);
        self.violations
            .retain(|v| now.saturating_duration_since(v.recorded) < RETENTION);
    }
}

/// Records usage samples per app and judges them against configured limits.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    apps: Mutex<HashMap<AppId, AppQuota>>,
}

impl QuotaTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the limits for an app.
    pub fn register_app(&self, app_id: &AppId, limits: ResourceLimits) {
        self.apps
            .lock()
            .expect("quota table poisoned")
            .insert(app_id.clone(), AppQuota::new(limits));
    }

    /// Drop all quota state for an app.
    pub fn unregister_app(&self, app_id: &AppId) {
        self.apps
            .lock()
            .expect("quota table poisoned")
            .remove(app_id);
    }

    /// Append a usage sample and re-evaluate every limited field.
    ///
    /// Returns the violations this sample produced, if any. Samples for
    /// unregistered apps are dropped.
    pub fn track_usage(&self, app_id: &AppId, sample: UsageSample) -> Vec<Violation> {
        let now = Instant::now();
        let mut apps = self.apps.lock().expect("quota table poisoned");
        match apps.get_mut(app_id) {
            Some(quota) => quota.push_sample(now, sample),
            None => Vec::new(),
        }
    }

    /// Record one completed outbound call: apiCalls and networkRequests
    /// each increment by one on top of the latest sample.
    pub fn record_call(&self, app_id: &AppId) {
        let now = Instant::now();
        let mut apps = self.apps.lock().expect("quota table poisoned");
        let Some(quota) = apps.get_mut(app_id) else {
            return;
        };
        let mut sample = quota.latest().copied().unwrap_or_else(UsageSample::empty);
        sample.api_calls += 1;
        sample.network_requests += 1;
        sample.at = Utc::now();
        quota.push_sample(now, sample);
    }

    /// Point check before allowing an action: does the latest sample leave
    /// room under the configured limit for `kind`?
    ///
    /// Returns `false` (deny) when the latest value is at or over the
    /// limit. Does not record a violation. No limit or no sample allows.
    #[must_use]
    pub fn enforce_limit(&self, app_id: &AppId, kind: ResourceKind) -> bool {
        let apps = self.apps.lock().expect("quota table poisoned");
        let Some(quota) = apps.get(app_id) else {
            return true;
        };
        let Some(limit) = quota.limits.limit(kind) else {
            return true;
        };
        match quota.latest() {
            Some(sample) => sample.value(kind) < limit,
            None => true,
        }
    }

    /// True if any suspend-action violation occurred in the last 5 minutes.
    #[must_use]
    pub fn should_suspend(&self, app_id: &AppId) -> bool {
        self.has_recent(app_id, ViolationAction::Suspend)
    }

    /// True if any throttle-action violation occurred in the last 5 minutes.
    #[must_use]
    pub fn should_throttle(&self, app_id: &AppId) -> bool {
        self.has_recent(app_id, ViolationAction::Throttle)
    }

    fn has_recent(&self, app_id: &AppId, action: ViolationAction) -> bool {
        let now = Instant::now();
        let apps = self.apps.lock().expect("quota table poisoned");
        apps.get(app_id)
            .is_some_and(|quota| quota.has_recent(action, now))
    }

    /// Latest usage sample for an app, if any.
    #[must_use]
    pub fn latest_sample(&self, app_id: &AppId) -> Option<UsageSample> {
        let apps = self.apps.lock().expect("quota table poisoned");
        apps.get(app_id).and_then(|quota| quota.latest().copied())
    }

    /// All recorded violations for an app, oldest first.
    #[must_use]
    pub fn violations(&self, app_id: &AppId) -> Vec<Violation> {
        let apps = self.apps.lock().expect("quota table poisoned");
        apps.get(app_id)
            .map(|quota| quota.violations.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear recorded violations for an app (operator override of the
    /// suspension gate).
    pub fn clear_violations(&self, app_id: &AppId) {
        let mut apps = self.apps.lock().expect("quota table poisoned");
        if let Some(quota) = apps.get_mut(app_id) {
            quota.violations.clear();
        }
    }

    /// Drop samples and violations older than 24 hours, for every app.
    /// Driven by the supervisor's periodic sweep.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        let mut apps = self.apps.lock().expect("quota table poisoned");
        for quota in apps.values_mut() {
            quota.prune(now);
        }
    }
}
