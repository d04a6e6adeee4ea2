//! Core domain types for the Appdock runtime.
//!
//! Pure data: identifiers, manifests, grants, usage accounting, message
//! envelopes, and the error taxonomy. No IO and no async — everything here
//! is owned by the components in `appdock-runtime` that give it behavior.

mod error;
mod ids;
mod manifest;
mod message;
mod request;
mod state;

pub use error::{BundleError, ManifestError, RuntimeError};
pub use ids::{AppId, CorrelationId};
pub use manifest::{
    AppManifest, ConditionField, ConditionOp, ConditionSpec, DependencySpec, GrantSpec, GrantType,
    ResourceKind, ResourceLimits, SecuritySpec, UsageSample,
};
pub use message::{AppMessage, HostMessage, LogLevel};
pub use request::{OutboundRequest, RequestContext};
pub use state::{InstanceSnapshot, InstanceState, RuntimeStats};
