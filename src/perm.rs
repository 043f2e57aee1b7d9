//! Authorization: may this principal do that to this resource?
//!
//! Permission management is pluggable; the broker only calls
//! [`PermissionManager::check`] when a manager is configured. The shipped
//! rule-based manager consults deny rules before allow rules.

use async_trait::async_trait;

use crate::auth::Principal;

/// Action name for joining a room.
pub const ACTION_JOIN: &str = "join";
/// Action name for writing operations into a room.
pub const ACTION_WRITE: &str = "write";
/// Action prefix for calling a registered function.
pub const ACTION_CALL: &str = "call";

/// Decides whether a principal may perform an action on a resource.
#[async_trait]
pub trait PermissionManager: Send + Sync {
    /// `resource` is typically a room id; `action` one of the `ACTION_*`
    /// constants or a function-specific permission string.
    async fn check(&self, principal: &Principal, resource: &str, action: &str) -> bool;
}

/// Permits everything. The default when no manager is configured.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionManager for AllowAll {
    async fn check(&self, _principal: &Principal, _resource: &str, _action: &str) -> bool {
        true
    }
}

/// One match clause. `None` fields are wildcards.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Required role, if any.
    pub role: Option<String>,
    /// Resource to match, if any.
    pub resource: Option<String>,
    /// Action to match, if any.
    pub action: Option<String>,
}

impl Rule {
    fn matches(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        if let Some(role) = &self.role {
            if !principal.has_role(role) {
                return false;
            }
        }
        if let Some(r) = &self.resource {
            if r != resource {
                return false;
            }
        }
        if let Some(a) = &self.action {
            if a != action {
                return false;
            }
        }
        true
    }
}

/// Rule-table manager: deny rules are consulted before allow rules, and an
/// unmatched request falls through to `default_allow`.
#[derive(Debug, Default)]
pub struct RuleBasedPermissions {
    deny: Vec<Rule>,
    allow: Vec<Rule>,
    default_allow: bool,
}

impl RuleBasedPermissions {
    /// Build an empty table with the given fallthrough.
    #[must_use]
    pub fn new(default_allow: bool) -> Self {
        Self { deny: Vec::new(), allow: Vec::new(), default_allow }
    }

    /// Append a deny rule.
    pub fn deny(&mut self, rule: Rule) -> &mut Self {
        self.deny.push(rule);
        self
    }

    /// Append an allow rule.
    pub fn allow(&mut self, rule: Rule) -> &mut Self {
        self.allow.push(rule);
        self
    }
}

#[async_trait]
impl PermissionManager for RuleBasedPermissions {
    async fn check(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        if self.deny.iter().any(|r| r.matches(principal, resource, action)) {
            return false;
        }
        if self.allow.iter().any(|r| r.matches(principal, resource, action)) {
            return true;
        }
        self.default_allow
    }
}
