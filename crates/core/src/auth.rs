use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a caller proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Anonymous,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey => f.write_str("api_key"),
            Self::Jwt => f.write_str("jwt"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}

/// The resolved identity and grants of the caller of one request.
///
/// Produced per request and dropped with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub session_id: Option<String>,
    pub permissions: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub scopes: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
    pub method: AuthMethod,
}

impl AuthContext {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check a `<system>:<action>` permission.
    ///
    /// `*` grants everything and `<system>:*` grants every action of a system.
    pub fn has_permission(&self, permission: &str) -> bool {
        if self.permissions.contains("*") || self.permissions.contains(permission) {
            return true;
        }
        permission
            .split_once(':')
            .is_some_and(|(system, _)| self.permissions.contains(&format!("{system}:*")))
    }

    /// Whether the caller may invoke `operation` (`"<system>.<action>"`).
    pub fn can_invoke(&self, operation: &str) -> bool {
        self.has_permission(&required_permission(operation))
    }
}

/// The permission guarding an operation: `cns.validate` needs `cns:validate`.
pub fn required_permission(operation: &str) -> String {
    match operation.split_once('.') {
        Some((system, action)) => format!("{system}:{action}"),
        None => format!("{operation}:*"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(permissions: &[&str]) -> AuthContext {
        AuthContext {
            user_id: "u-1".into(),
            session_id: None,
            permissions: permissions.iter().map(|p| (*p).to_owned()).collect(),
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            method: AuthMethod::ApiKey,
        }
    }

    #[test]
    fn exact_permission() {
        let ctx = context(&["marketplace:search"]);
        assert!(ctx.can_invoke("marketplace.search"));
        assert!(!ctx.can_invoke("marketplace.purchase"));
    }

    #[test]
    fn system_wildcard() {
        let ctx = context(&["cns:*"]);
        assert!(ctx.can_invoke("cns.validate-uhft"));
        assert!(!ctx.can_invoke("bytestar.ai-enhance"));
    }

    #[test]
    fn global_wildcard() {
        let ctx = context(&["*"]);
        assert!(ctx.can_invoke("anything.at-all"));
    }

    #[test]
    fn undotted_operation_needs_system_wildcard() {
        assert_eq!(required_permission("ping"), "ping:*");
        assert!(context(&["ping:*"]).can_invoke("ping"));
    }

    #[test]
    fn expiry() {
        let ctx = context(&[]);
        assert!(!ctx.is_expired(Utc::now()));
        assert!(ctx.is_expired(ctx.expires_at));
    }
}
