//! Supervisor ↔ context message envelopes.
//!
//! A closed tagged union per direction. These travel over in-process
//! channels, never a wire, so the payloads stay as `serde_json::Value`
//! where the schema belongs to the app bundle rather than the host.
//! Dispatch sites keep an explicit unrecognized-message fallback (log,
//! no-op) for forward compatibility — see `HostMessage::Custom` and
//! `AppMessage::Other`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AppId, CorrelationId};
use crate::manifest::{AppManifest, UsageSample};
use crate::request::OutboundRequest;

/// Messages the supervisor sends into a sandboxed execution context.
#[derive(Debug, Clone)]
pub enum HostMessage {
    /// Initialization handshake: carries the identity and manifest the
    /// context needs to resolve dependencies and instantiate the bundle.
    InitApp {
        app_id: AppId,
        manifest: AppManifest,
    },
    /// A UI event to dispatch to the app's event hook.
    UiEvent { event: Value },
    /// A lifecycle or app-defined command.
    AppCommand {
        command: String,
        data: Value,
        request_id: Option<CorrelationId>,
    },
    /// Latest resource usage pushed down for the app's own awareness.
    ResourceUpdate { usage: UsageSample },
    /// Terminate the context. Irrecoverable.
    Shutdown,
    /// Response to an earlier outbound `ApiCall`, matched by correlation id.
    ApiResponse {
        request_id: CorrelationId,
        result: Result<Value, String>,
    },
    /// Forward-compatibility escape hatch: unknown message kinds are
    /// delivered as-is and logged by the context, never fatal.
    Custom {
        message_type: String,
        payload: Value,
        request_id: Option<CorrelationId>,
    },
}

/// Messages a sandboxed execution context sends back to the supervisor.
#[derive(Debug, Clone)]
pub enum AppMessage {
    /// An outbound call the gateway must mediate.
    ApiCall {
        request_id: CorrelationId,
        request: OutboundRequest,
    },
    /// A UI mutation to re-emit as a host-level notification.
    UiUpdate { payload: Value },
    /// App log line to re-emit as a host-level notification.
    Log {
        level: LogLevel,
        message: String,
        data: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    /// Handshake success.
    AppReady { app_id: AppId },
    /// Handshake failure or runtime fault.
    AppError { app_id: AppId, error: String },
    /// Anything else. With a `request_id` this resolves a pending
    /// correlation if one is waiting; otherwise it is re-emitted as a
    /// generic app message.
    Other {
        message_type: String,
        payload: Value,
        request_id: Option<CorrelationId>,
    },
}

/// Severity of an app log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}
