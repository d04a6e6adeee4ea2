//! Outbound request model and the request-time context grants are
//! evaluated against.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request-time context for permission condition evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl RequestContext {
    /// Value of one named context field, as a string.
    ///
    /// Known fields resolve from the typed slots; anything else falls back
    /// to the free-form metadata map.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "userId" => self.user_id.clone(),
            "orgId" => self.org_id.clone(),
            "sessionId" => self.session_id.clone(),
            "timestamp" => self.timestamp.map(|t| t.to_rfc3339()),
            other => self.metadata.get(other).cloned(),
        }
    }
}

/// An outbound call as the sandboxed app expresses it: a relative endpoint
/// plus method, body, headers, and the context the permission engine
/// evaluates conditions against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub context: RequestContext,
}

fn default_method() -> String {
    "GET".to_string()
}

impl OutboundRequest {
    /// A GET request to `endpoint` with an empty context.
    #[must_use]
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: default_method(),
            body: None,
            headers: BTreeMap::new(),
            context: RequestContext::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_field_lookup_prefers_typed_slots() {
        let mut ctx = RequestContext {
            user_id: Some("u-1".to_string()),
            ..Default::default()
        };
        ctx.metadata
            .insert("tenantTier".to_string(), "gold".to_string());

        assert_eq!(ctx.field("userId").as_deref(), Some("u-1"));
        assert_eq!(ctx.field("tenantTier").as_deref(), Some("gold"));
        assert_eq!(ctx.field("orgId"), None);
    }

    #[test]
    fn outbound_request_defaults_to_get() {
        let request: OutboundRequest =
            serde_json::from_str(r#"{"endpoint": "/api/data/profile"}"#).expect("should parse");
        assert_eq!(request.method, "GET");
        assert!(request.headers.is_empty());
    }
}
