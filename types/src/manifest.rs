//! App manifest domain model.
//!
//! A manifest is external input: it declares the permissions an app wants,
//! the resource limits it runs under, its security lists, and its
//! dependencies. Grant types and condition operators arrive as strings and
//! are validated at registration time (strict: any error refuses the whole
//! registration), so the raw manifest structs keep them as strings and
//! expose typed parses for the permission engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Declared shape of a third-party app bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppManifest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub permissions: Vec<GrantSpec>,
    pub resources: ResourceLimits,
    pub security: SecuritySpec,
    pub dependencies: Vec<DependencySpec>,
}

impl AppManifest {
    /// Validate every grant declaration, collecting all errors rather than
    /// stopping at the first. Registration is refused if any error exists.
    #[must_use]
    pub fn validate(&self) -> Vec<ManifestError> {
        let mut errors = Vec::new();
        for (index, grant) in self.permissions.iter().enumerate() {
            if GrantType::parse(&grant.grant_type).is_none() {
                errors.push(ManifestError::UnknownGrantType {
                    index,
                    found: grant.grant_type.clone(),
                });
            }
            if grant.resource.is_empty() {
                errors.push(ManifestError::EmptyResource { index });
            }
            if grant.actions.is_empty() {
                errors.push(ManifestError::NoActions { index });
            }
            for condition in &grant.conditions {
                if condition.field.is_empty() {
                    errors.push(ManifestError::MalformedCondition {
                        index,
                        detail: "empty field".to_string(),
                    });
                }
                if ConditionOp::parse(&condition.operator).is_none() {
                    errors.push(ManifestError::MalformedCondition {
                        index,
                        detail: format!("unknown operator '{}'", condition.operator),
                    });
                }
            }
        }
        errors
    }
}

/// One declared permission rule: `(type, resource pattern, actions, conditions)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantSpec {
    #[serde(rename = "type")]
    pub grant_type: String,
    pub resource: String,
    pub actions: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
}

/// Closed set of grant categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantType {
    Api,
    Data,
    Ui,
    Network,
}

impl GrantType {
    /// Parse a manifest grant-type string. `None` for unrecognized types.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "api" => Some(Self::Api),
            "data" => Some(Self::Data),
            "ui" => Some(Self::Ui),
            "network" => Some(Self::Network),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Data => "data",
            Self::Ui => "ui",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contextual condition on a grant: `(field, operator, value)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub field: String,
    pub operator: String,
    pub value: String,
}

/// Condition operators recognized in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Equals,
    Contains,
    StartsWith,
    Regex,
}

impl ConditionOp {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "equals" => Some(Self::Equals),
            "contains" => Some(Self::Contains),
            "startsWith" => Some(Self::StartsWith),
            "regex" => Some(Self::Regex),
            _ => None,
        }
    }
}

/// Well-known request-context fields a condition can target.
///
/// Anything outside the fixed set is looked up in the request's free-form
/// metadata map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionField {
    UserId,
    OrgId,
    SessionId,
    Timestamp,
    Metadata(String),
}

impl ConditionField {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "userId" => Self::UserId,
            "orgId" => Self::OrgId,
            "sessionId" => Self::SessionId,
            "timestamp" => Self::Timestamp,
            other => Self::Metadata(other.to_string()),
        }
    }
}

/// Per-app denylist/allowlist consulted in addition to grant matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySpec {
    /// Resource identifiers the app may never touch, regardless of grants.
    pub blocked_apis: Vec<String>,
    /// Network domain allowlist: exact, `*`, or `*.suffix`. Empty allows all.
    pub allowed_domains: Vec<String>,
}

/// One declared dependency of an app bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySpec {
    pub name: String,
    pub required: bool,
}

impl Default for DependencySpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            required: true,
        }
    }
}

/// Configured resource ceilings. Absent field ⇒ no limit (fail-open).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_requests: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<f64>,
}

impl ResourceLimits {
    /// Configured limit for one resource field, if any.
    #[must_use]
    pub fn limit(&self, kind: ResourceKind) -> Option<f64> {
        match kind {
            ResourceKind::Memory => self.memory,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Storage => self.storage,
            ResourceKind::NetworkRequests => self.network_requests,
            ResourceKind::ApiCalls => self.api_calls,
        }
    }
}

/// The five numeric fields of a usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Memory,
    Cpu,
    Storage,
    NetworkRequests,
    ApiCalls,
}

impl ResourceKind {
    pub const ALL: [Self; 5] = [
        Self::Memory,
        Self::Cpu,
        Self::Storage,
        Self::NetworkRequests,
        Self::ApiCalls,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Storage => "storage",
            Self::NetworkRequests => "networkRequests",
            Self::ApiCalls => "apiCalls",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point-in-time usage measurement for an app.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub memory: f64,
    pub cpu: f64,
    pub storage: f64,
    pub network_requests: u64,
    pub api_calls: u64,
    pub at: DateTime<Utc>,
}

impl UsageSample {
    /// A zeroed sample stamped now.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            memory: 0.0,
            cpu: 0.0,
            storage: 0.0,
            network_requests: 0,
            api_calls: 0,
            at: Utc::now(),
        }
    }

    /// Numeric value of one field, for limit comparison.
    #[must_use]
    pub fn value(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Memory => self.memory,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Storage => self.storage,
            ResourceKind::NetworkRequests => self.network_requests as f64,
            ResourceKind::ApiCalls => self.api_calls as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(grant_type: &str, resource: &str, actions: &[&str]) -> GrantSpec {
        GrantSpec {
            grant_type: grant_type.to_string(),
            resource: resource.to_string(),
            actions: actions.iter().map(ToString::to_string).collect(),
            conditions: vec![],
        }
    }

    #[test]
    fn valid_manifest_has_no_errors() {
        let manifest = AppManifest {
            name: "demo".to_string(),
            permissions: vec![grant("api", "/api/data/*", &["GET"])],
            ..Default::default()
        };
        assert!(manifest.validate().is_empty());
    }

    #[test]
    fn validation_collects_every_error() {
        let mut bad = grant("filesystem", "", &[]);
        bad.conditions.push(ConditionSpec {
            field: "userId".to_string(),
            operator: "isLike".to_string(),
            value: "u-1".to_string(),
        });
        let manifest = AppManifest {
            name: "demo".to_string(),
            permissions: vec![bad],
            ..Default::default()
        };
        let errors = manifest.validate();
        assert_eq!(errors.len(), 4);
        assert!(matches!(
            errors[0],
            ManifestError::UnknownGrantType { index: 0, .. }
        ));
        assert!(matches!(errors[1], ManifestError::EmptyResource { index: 0 }));
        assert!(matches!(errors[2], ManifestError::NoActions { index: 0 }));
        assert!(matches!(
            errors[3],
            ManifestError::MalformedCondition { index: 0, .. }
        ));
    }

    #[test]
    fn manifest_deserializes_from_camel_case_json() {
        let manifest: AppManifest = serde_json::from_str(
            r#"{
                "name": "weather",
                "permissions": [
                    {"type": "network", "resource": "api.example.com", "actions": ["*"]}
                ],
                "resources": {"apiCalls": 5, "memory": 1048576},
                "security": {"allowedDomains": ["*.example.com"]},
                "dependencies": [{"name": "charts", "required": false}]
            }"#,
        )
        .expect("manifest should parse");
        assert_eq!(manifest.name, "weather");
        assert_eq!(manifest.resources.api_calls, Some(5.0));
        assert_eq!(manifest.security.allowed_domains, vec!["*.example.com"]);
        assert!(!manifest.dependencies[0].required);
        assert!(manifest.validate().is_empty());
    }

    #[test]
    fn condition_field_falls_back_to_metadata() {
        assert_eq!(ConditionField::parse("userId"), ConditionField::UserId);
        assert_eq!(
            ConditionField::parse("tenantTier"),
            ConditionField::Metadata("tenantTier".to_string())
        );
    }

    #[test]
    fn usage_sample_field_access() {
        let sample = UsageSample {
            memory: 10.0,
            cpu: 0.5,
            storage: 3.0,
            network_requests: 7,
            api_calls: 2,
            at: Utc::now(),
        };
        assert_eq!(sample.value(ResourceKind::NetworkRequests), 7.0);
        assert_eq!(sample.value(ResourceKind::Cpu), 0.5);
    }
}
