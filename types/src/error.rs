//! Error taxonomy for the runtime.
//!
//! Policy denials (permission, quota, rate limit) are *not* errors — they
//! are structured outcome values on the component contracts. The types
//! here cover the fatal and operational failures: bad manifests, lifecycle
//! misuse, handshake failures, and timeouts.

use crate::ids::AppId;
use crate::state::InstanceState;

/// A single manifest validation failure. Registration collects all of
/// them and refuses the manifest if any exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("permission {index}: unrecognized grant type '{found}'")]
    UnknownGrantType { index: usize, found: String },
    #[error("permission {index}: empty resource pattern")]
    EmptyResource { index: usize },
    #[error("permission {index}: no actions declared")]
    NoActions { index: usize },
    #[error("permission {index}: malformed condition ({detail})")]
    MalformedCondition { index: usize, detail: String },
}

/// Failures surfaced by supervisor lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("app {0} is already loaded")]
    AlreadyLoaded(AppId),
    #[error("app {0} is not loaded")]
    NotLoaded(AppId),
    #[error("app limit reached ({max} concurrent apps)")]
    CapacityExceeded { max: usize },
    #[error("manifest rejected: {}", format_manifest_errors(.0))]
    InvalidManifest(Vec<ManifestError>),
    #[error("app {0} is suspended by quota policy")]
    Suspended(AppId),
    #[error("app {app_id} cannot {op} while {state}")]
    InvalidState {
        app_id: AppId,
        state: InstanceState,
        op: &'static str,
    },
    #[error("app {app_id} failed to initialize: {reason}")]
    InitFailed { app_id: AppId, reason: String },
    #[error("app {0} initialization timed out")]
    InitTimeout(AppId),
    #[error("context for app {0} is terminated")]
    ContextTerminated(AppId),
    #[error("no response from app {0} within the correlation timeout")]
    ResponseTimeout(AppId),
}

fn format_manifest_errors(errors: &[ManifestError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures raised by app bundle code or its loader.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("required dependency '{name}' is not available")]
    MissingDependency { name: String },
    #[error("bundle load failed: {0}")]
    LoadFailed(String),
    #[error("{hook} hook failed: {reason}")]
    HookFailed { hook: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_manifest_lists_every_error() {
        let err = RuntimeError::InvalidManifest(vec![
            ManifestError::EmptyResource { index: 0 },
            ManifestError::NoActions { index: 2 },
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("permission 0: empty resource pattern"));
        assert!(rendered.contains("permission 2: no actions declared"));
    }
}
