//! App runtime supervisor for sandboxed third-party bundles.
//!
//! # Architecture
//!
//! The crate is organized around five components, leaves first:
//!
//! - [`permissions::PermissionEngine`] - grant registration and
//!   request-time permission checks
//! - [`quota::QuotaTracker`] - usage samples, violation policy, and the
//!   suspend/throttle lifecycle gates
//! - [`gateway::Gateway`] - the only path from a sandboxed context to the
//!   outside world: rate limiting, policy checks, retry with backoff,
//!   metrics
//! - [`context`] - the sandboxed execution context hosting the app's own
//!   code behind the [`context::AppBundle`] trait
//! - [`supervisor::Supervisor`] - the instance registry, lifecycle state
//!   machine, message routing, and periodic sweeps
//!
//! All cross-cutting state is partitioned by app id and owned by its
//! component; nothing one app does can block or corrupt another app's
//! state. Policy refusals are structured outcome values, never errors
//! thrown across a component boundary.
//!
//! # Hosting an app
//!
//! The host supplies a [`context::BundleLoader`] (how bundles are
//! resolved and instantiated) and a [`executor::CallExecutor`] (how
//! shaped outbound calls execute; [`executor::HttpExecutor`] is the HTTP
//! default), then drives everything through [`supervisor::Supervisor`]:
//! `load`, `start`, `stop`, `pause`, `resume`, `unload`, `send_message`,
//! `send_ui_event`, plus `subscribe` for host-level notifications.

pub mod config;
pub mod context;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod permissions;
pub mod quota;
pub mod supervisor;

pub use appdock_types as types;

pub use config::{GatewayConfig, RuntimeConfig};
pub use context::{AppBundle, BundleLoader, HostApi};
pub use events::HostEvent;
pub use executor::{CallError, CallExecutor, CallResponse, HttpExecutor, ShapedRequest};
pub use gateway::{CallOutcome, DenialStage, Gateway};
pub use permissions::{Decision, PermissionEngine};
pub use quota::{QuotaTracker, Violation, ViolationAction};
pub use supervisor::Supervisor;
