//! Permission engine: grant registration and request-time checks.
//!
//! Grants are registered in bulk from the manifest at load time, are
//! immutable for the app's lifetime, and are removed en masse on unload.
//! Checks are read-mostly and safe to run concurrently for many apps; the
//! only write on the check path is the audit append.
//!
//! Registration is strict: any invalid grant (unknown type, empty
//! resource, no actions, malformed condition) refuses the whole set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use appdock_types::{
    AppId, ConditionField, ConditionOp, GrantSpec, GrantType, ManifestError, RequestContext,
    RuntimeError, SecuritySpec,
};

/// Audit log capacity; oldest entries are trimmed.
const AUDIT_CAP: usize = 10_000;

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// One audited permission check.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub app_id: AppId,
    pub grant_type: GrantType,
    pub resource: String,
    pub action: String,
    pub allowed: bool,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// A resource pattern compiled at registration.
#[derive(Debug, Clone)]
enum ResourcePattern {
    Exact(String),
    Any,
    Glob(Regex),
}

impl ResourcePattern {
    fn compile(raw: &str) -> Self {
        if raw == "*" {
            return Self::Any;
        }
        if raw.contains('*') {
            let mut pattern = String::with_capacity(raw.len() + 8);
            pattern.push('^');
            for ch in raw.chars() {
                if ch == '*' {
                    pattern.push_str(".*");
                } else {
                    pattern.push_str(&regex::escape(&ch.to_string()));
                }
            }
            pattern.push('$');
            // Escaping leaves only literal chars and `.*`; this cannot fail.
            if let Ok(regex) = Regex::new(&pattern) {
                return Self::Glob(regex);
            }
        }
        Self::Exact(raw.to_string())
    }

    fn matches(&self, resource: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == resource,
            Self::Any => true,
            Self::Glob(regex) => regex.is_match(resource),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    field: ConditionField,
    field_name: String,
    op: ConditionOp,
    value: String,
    regex: Option<Regex>,
}

impl CompiledCondition {
    fn holds(&self, context: &RequestContext) -> bool {
        let Some(actual) = context.field(&self.field_name) else {
            return false;
        };
        match self.op {
            ConditionOp::Equals => actual == self.value,
            ConditionOp::Contains => actual.contains(&self.value),
            ConditionOp::StartsWith => actual.starts_with(&self.value),
            ConditionOp::Regex => self.regex.as_ref().is_some_and(|r| r.is_match(&actual)),
        }
    }

    fn describe(&self) -> String {
        let field = match &self.field {
            ConditionField::Metadata(key) => key.as_str(),
            _ => self.field_name.as_str(),
        };
        format!("condition failed: {} {:?} '{}'", field, self.op, self.value)
    }
}

#[derive(Debug, Clone)]
struct CompiledGrant {
    grant_type: GrantType,
    pattern: ResourcePattern,
    actions: Vec<String>,
    conditions: Vec<CompiledCondition>,
}

impl CompiledGrant {
    fn covers(&self, grant_type: GrantType, resource: &str, action: &str) -> bool {
        self.grant_type == grant_type
            && self.pattern.matches(resource)
            && self
                .actions
                .iter()
                .any(|a| a == action || a == "*")
    }
}

#[derive(Debug, Default)]
struct AppPermissions {
    grants: Vec<CompiledGrant>,
    blocked: HashSet<String>,
    allowed_domains: Vec<String>,
}

/// Evaluates whether an app may perform an action against a resource.
#[derive(Debug, Default)]
pub struct PermissionEngine {
    apps: RwLock<HashMap<AppId, Arc<AppPermissions>>>,
    audit: Mutex<VecDeque<AuditEntry>>,
}

impl PermissionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an app's grants and security config in bulk.
    ///
    /// Strict validation: collects every grant error and refuses the whole
    /// registration if any exist. Replaces any previous registration for
    /// the same app.
    pub fn register_app(
        &self,
        app_id: &AppId,
        grants: &[GrantSpec],
        security: &SecuritySpec,
    ) -> Result<(), RuntimeError> {
        let mut errors = Vec::new();
        let mut compiled = Vec::with_capacity(grants.len());

        for (index, spec) in grants.iter().enumerate() {
            let grant_type = match GrantType::parse(&spec.grant_type) {
                Some(t) => t,
                None => {
                    errors.push(ManifestError::UnknownGrantType {
                        index,
                        found: spec.grant_type.clone(),
                    });
                    continue;
                }
            };
            if spec.resource.is_empty() {
                errors.push(ManifestError::EmptyResource { index });
            }
            if spec.actions.is_empty() {
                errors.push(ManifestError::NoActions { index });
            }

            let mut conditions = Vec::with_capacity(spec.conditions.len());
            for condition in &spec.conditions {
                if condition.field.is_empty() {
                    errors.push(ManifestError::MalformedCondition {
                        index,
                        detail: "empty field".to_string(),
                    });
                    continue;
                }
                let Some(op) = ConditionOp::parse(&condition.operator) else {
                    errors.push(ManifestError::MalformedCondition {
                        index,
                        detail: format!("unknown operator '{}'", condition.operator),
                    });
                    continue;
                };
                let regex = if op == ConditionOp::Regex {
                    match Regex::new(&condition.value) {
                        Ok(r) => Some(r),
                        Err(e) => {
                            errors.push(ManifestError::MalformedCondition {
                                index,
                                detail: format!("invalid regex '{}': {e}", condition.value),
                            });
                            continue;
                        }
                    }
                } else {
                    None
                };
                conditions.push(CompiledCondition {
                    field: ConditionField::parse(&condition.field),
                    field_name: condition.field.clone(),
                    op,
                    value: condition.value.clone(),
                    regex,
                });
            }

            compiled.push(CompiledGrant {
                grant_type,
                pattern: ResourcePattern::compile(&spec.resource),
                actions: spec.actions.clone(),
                conditions,
            });
        }

        if !errors.is_empty() {
            return Err(RuntimeError::InvalidManifest(errors));
        }

        let permissions = Arc::new(AppPermissions {
            grants: compiled,
            blocked: security.blocked_apis.iter().cloned().collect(),
            allowed_domains: security.allowed_domains.clone(),
        });
        self.apps
            .write()
            .expect("permission table poisoned")
            .insert(app_id.clone(), permissions);
        tracing::debug!(app_id = %app_id, grants = grants.len(), "registered app permissions");
        Ok(())
    }

    /// Remove an app's grants and security config en masse.
    pub fn unregister_app(&self, app_id: &AppId) {
        self.apps
            .write()
            .expect("permission table poisoned")
            .remove(app_id);
    }

    #[must_use]
    pub fn is_registered(&self, app_id: &AppId) -> bool {
        self.apps
            .read()
            .expect("permission table poisoned")
            .contains_key(app_id)
    }

    /// Check whether `app_id` may perform `action` on `resource`.
    ///
    /// Every check is audited, allowed or not.
    #[must_use]
    pub fn check(
        &self,
        app_id: &AppId,
        grant_type: GrantType,
        resource: &str,
        action: &str,
        context: &RequestContext,
    ) -> Decision {
        let permissions = {
            let apps = self.apps.read().expect("permission table poisoned");
            apps.get(app_id).cloned()
        };
        let decision = match permissions {
            None => Decision::deny(format!("app '{app_id}' has no registered permissions")),
            Some(permissions) => Self::evaluate(&permissions, grant_type, resource, action, context),
        };
        self.record_audit(app_id, grant_type, resource, action, &decision);
        decision
    }

    fn evaluate(
        permissions: &AppPermissions,
        grant_type: GrantType,
        resource: &str,
        action: &str,
        context: &RequestContext,
    ) -> Decision {
        if permissions.blocked.contains(resource) {
            return Decision::deny(format!("resource '{resource}' is blocked"));
        }

        let Some(grant) = permissions
            .grants
            .iter()
            .find(|g| g.covers(grant_type, resource, action))
        else {
            return Decision::deny(format!(
                "no grant covers {grant_type} '{resource}' action '{action}'"
            ));
        };

        for condition in &grant.conditions {
            if !condition.holds(context) {
                return Decision::deny(condition.describe());
            }
        }

        if grant_type == GrantType::Network
            && !domain_allowed(&permissions.allowed_domains, resource)
        {
            return Decision::deny(format!("domain '{resource}' is not in the allowlist"));
        }

        Decision::allow()
    }

    fn record_audit(
        &self,
        app_id: &AppId,
        grant_type: GrantType,
        resource: &str,
        action: &str,
        decision: &Decision,
    ) {
        let mut audit = self.audit.lock().expect("audit log poisoned");
        if audit.len() >= AUDIT_CAP {
            audit.pop_front();
        }
        audit.push_back(AuditEntry {
            app_id: app_id.clone(),
            grant_type,
            resource: resource.to_string(),
            action: action.to_string(),
            allowed: decision.allowed,
            reason: decision.reason.clone(),
            at: Utc::now(),
        });
    }

    /// Snapshot of the audit log, oldest first.
    #[must_use]
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .expect("audit log poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Network-domain allowlist check: empty list allows everything; entries
/// are exact domains, `*`, or `*.suffix` matched by suffix comparison.
fn domain_allowed(allowed: &[String], domain: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|entry| {
        if entry == "*" {
            return true;
        }
        if let Some(suffix) = entry.strip_prefix('*') {
            return domain.ends_with(suffix);
        }
        entry == domain
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use appdock_types::ConditionSpec;

    fn grant(grant_type: &str, resource: &str, actions: &[&str]) -> GrantSpec {
        GrantSpec {
            grant_type: grant_type.to_string(),
            resource: resource.to_string(),
            actions: actions.iter().map(ToString::to_string).collect(),
            conditions: vec![],
        }
    }

    fn register(engine: &PermissionEngine, app: &AppId, grants: Vec<GrantSpec>) {
        engine
            .register_app(app, &grants, &SecuritySpec::default())
            .expect("registration should succeed");
    }

    #[test]
    fn unregistered_app_is_denied() {
        let engine = PermissionEngine::new();
        let decision = engine.check(
            &AppId::from("ghost"),
            GrantType::Api,
            "/api/data",
            "GET",
            &RequestContext::default(),
        );
        assert!(!decision.allowed);
    }

    #[test]
    fn exact_star_and_glob_patterns() {
        let engine = PermissionEngine::new();
        let app = AppId::from("patterns");
        register(
            &engine,
            &app,
            vec![
                grant("api", "/api/exact", &["GET"]),
                grant("data", "*", &["read"]),
                grant("api", "/api/data/*", &["GET"]),
            ],
        );
        let ctx = RequestContext::default();

        assert!(engine.check(&app, GrantType::Api, "/api/exact", "GET", &ctx).allowed);
        assert!(!engine.check(&app, GrantType::Api, "/api/exact2", "GET", &ctx).allowed);
        assert!(engine.check(&app, GrantType::Data, "anything/at/all", "read", &ctx).allowed);
        assert!(engine.check(&app, GrantType::Api, "/api/data/profile", "GET", &ctx).allowed);
        assert!(!engine.check(&app, GrantType::Api, "/api/data/profile", "DELETE", &ctx).allowed);
    }

    #[test]
    fn wildcard_action_covers_everything() {
        let engine = PermissionEngine::new();
        let app = AppId::from("actions");
        register(&engine, &app, vec![grant("ui", "panel", &["*"])]);
        let ctx = RequestContext::default();
        assert!(engine.check(&app, GrantType::Ui, "panel", "render", &ctx).allowed);
        assert!(engine.check(&app, GrantType::Ui, "panel", "hide", &ctx).allowed);
    }

    #[test]
    fn failed_condition_names_itself_in_the_reason() {
        let engine = PermissionEngine::new();
        let app = AppId::from("conditions");
        let mut g = grant("api", "/api/admin", &["GET"]);
        g.conditions.push(ConditionSpec {
            field: "userId".to_string(),
            operator: "startsWith".to_string(),
            value: "admin-".to_string(),
        });
        register(&engine, &app, vec![g]);

        let denied = engine.check(
            &app,
            GrantType::Api,
            "/api/admin",
            "GET",
            &RequestContext {
                user_id: Some("user-7".to_string()),
                ..Default::default()
            },
        );
        assert!(!denied.allowed);
        assert!(denied.reason.as_deref().unwrap().contains("userId"));

        let allowed = engine.check(
            &app,
            GrantType::Api,
            "/api/admin",
            "GET",
            &RequestContext {
                user_id: Some("admin-1".to_string()),
                ..Default::default()
            },
        );
        assert!(allowed.allowed);
    }

    #[test]
    fn blocked_resource_wins_over_matching_grant() {
        let engine = PermissionEngine::new();
        let app = AppId::from("blocked");
        engine
            .register_app(
                &app,
                &[grant("api", "*", &["*"])],
                &SecuritySpec {
                    blocked_apis: vec!["/api/internal".to_string()],
                    allowed_domains: vec![],
                },
            )
            .expect("registration should succeed");
        let ctx = RequestContext::default();
        assert!(!engine.check(&app, GrantType::Api, "/api/internal", "GET", &ctx).allowed);
        assert!(engine.check(&app, GrantType::Api, "/api/public", "GET", &ctx).allowed);
    }

    #[test]
    fn network_allowlist_suffix_matching() {
        let engine = PermissionEngine::new();
        let app = AppId::from("net");
        engine
            .register_app(
                &app,
                &[grant("network", "*", &["*"])],
                &SecuritySpec {
                    blocked_apis: vec![],
                    allowed_domains: vec!["*.example.com".to_string()],
                },
            )
            .expect("registration should succeed");
        let ctx = RequestContext::default();
        assert!(engine.check(&app, GrantType::Network, "api.example.com", "request", &ctx).allowed);
        assert!(!engine.check(&app, GrantType::Network, "other.com", "request", &ctx).allowed);
    }

    #[test]
    fn empty_allowlist_allows_any_domain() {
        let engine = PermissionEngine::new();
        let app = AppId::from("net-open");
        register(&engine, &app, vec![grant("network", "*", &["*"])]);
        let ctx = RequestContext::default();
        assert!(engine.check(&app, GrantType::Network, "anywhere.io", "request", &ctx).allowed);
    }

    #[test]
    fn registration_is_refused_on_any_invalid_grant() {
        let engine = PermissionEngine::new();
        let app = AppId::from("strict");
        let result = engine.register_app(
            &app,
            &[grant("api", "/ok", &["GET"]), grant("filesystem", "/bad", &["read"])],
            &SecuritySpec::default(),
        );
        assert!(matches!(result, Err(RuntimeError::InvalidManifest(_))));
        // nothing was registered, not even the valid grant
        assert!(!engine.is_registered(&app));
    }

    #[test]
    fn invalid_condition_regex_refuses_registration() {
        let engine = PermissionEngine::new();
        let app = AppId::from("bad-regex");
        let mut g = grant("api", "/api", &["GET"]);
        g.conditions.push(ConditionSpec {
            field: "sessionId".to_string(),
            operator: "regex".to_string(),
            value: "(unclosed".to_string(),
        });
        let result = engine.register_app(&app, &[g], &SecuritySpec::default());
        assert!(matches!(result, Err(RuntimeError::InvalidManifest(_))));
    }

    #[test]
    fn apps_are_independent_partitions() {
        let engine = PermissionEngine::new();
        let a = AppId::from("app-a");
        let b = AppId::from("app-b");
        register(&engine, &a, vec![grant("api", "/api/a/*", &["GET"])]);
        register(&engine, &b, vec![grant("api", "/api/b/*", &["GET"])]);
        let ctx = RequestContext::default();

        assert!(engine.check(&a, GrantType::Api, "/api/a/x", "GET", &ctx).allowed);
        assert!(!engine.check(&a, GrantType::Api, "/api/b/x", "GET", &ctx).allowed);

        // removing B leaves A untouched
        engine.unregister_app(&b);
        assert!(engine.check(&a, GrantType::Api, "/api/a/x", "GET", &ctx).allowed);
        assert!(!engine.check(&b, GrantType::Api, "/api/b/x", "GET", &ctx).allowed);
    }

    #[test]
    fn every_check_is_audited() {
        let engine = PermissionEngine::new();
        let app = AppId::from("audited");
        register(&engine, &app, vec![grant("api", "/api", &["GET"])]);
        let ctx = RequestContext::default();
        let _ = engine.check(&app, GrantType::Api, "/api", "GET", &ctx);
        let _ = engine.check(&app, GrantType::Api, "/api", "POST", &ctx);

        let log = engine.audit_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].allowed);
        assert!(!log[1].allowed);
        assert!(log[1].reason.is_some());
    }
}
