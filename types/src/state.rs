//! Instance lifecycle states and reporting snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::AppId;
use crate::manifest::UsageSample;

/// Lifecycle state of one loaded app instance.
///
/// # State Machine
/// ```text
///            handshake ok                start/resume
/// ┌─────────┐ ─────────> ┌────────┐ ──────────────> ┌─────────┐
/// │ Loading │            │ Paused │ <────────────── │ Running │
/// └─────────┘            └────────┘   stop/pause    └─────────┘
///      │ handshake failure     ^                         │
///      v                       │ (context fault from     v
/// ┌─────────┐ <────────────────┴── any state) ────> ┌─────────┐
/// │  Error  │                                       │  Error  │
/// └─────────┘                                       └─────────┘
/// ```
/// `unloaded` is not a state: unload erases the instance entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Loading,
    Paused,
    Running,
    Error,
}

impl InstanceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one instance, handed out by the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub app_id: AppId,
    pub name: String,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSample>,
}

/// Aggregate view across all live instances.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub total_apps: usize,
    pub loading: usize,
    pub running: usize,
    pub paused: usize,
    pub errored: usize,
    pub total_memory: f64,
    pub total_api_calls: u64,
}
