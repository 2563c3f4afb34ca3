//! # Cache Invalidation Module
//!
//! Invalidation events for the retail cache namespaces and the key/pattern
//! constructors they are built from. An [`InvalidationEvent`] expands to one or
//! more glob patterns; the cache manager runs those concurrently against the
//! backend.
//!
//! Key namespaces:
//! - `inventory:*`, `transfers:*`, `invoices:*`, `reference:*`, `stats:*`
//! - `auth:session:{user}`, `auth:perms:{user}`, `auth:role:{role}`,
//!   `auth:token:{user}:{token}`

use serde::{Deserialize, Serialize};

/// Key and pattern constructors for every cache namespace
pub mod keys {
    pub const INVENTORY: &str = "inventory";
    pub const TRANSFERS: &str = "transfers";
    pub const INVOICES: &str = "invoices";
    pub const REFERENCE: &str = "reference";
    pub const STATS: &str = "stats";

    pub fn user_session(user_id: &str) -> String {
        format!("auth:session:{}", user_id)
    }

    pub fn user_permissions(user_id: &str) -> String {
        format!("auth:perms:{}", user_id)
    }

    pub fn role_permissions(role_id: &str) -> String {
        format!("auth:role:{}", role_id)
    }

    pub fn token_validation(user_id: &str, token_id: &str) -> String {
        format!("auth:token:{}:{}", user_id, token_id)
    }

    pub fn reference(name: &str) -> String {
        format!("{}:{}", REFERENCE, name)
    }

    pub fn stats(name: &str) -> String {
        format!("{}:{}", STATS, name)
    }

    /// Every key in a namespace
    pub fn namespace(prefix: &str) -> String {
        format!("{}:*", prefix)
    }

    pub(crate) fn all_user_permissions() -> String {
        "auth:perms:*".to_string()
    }

    pub(crate) fn user_tokens(user_id: &str) -> String {
        format!("auth:token:{}:*", user_id)
    }

    pub(crate) fn token_any_user(token_id: &str) -> String {
        format!("auth:token:*:{}", token_id)
    }
}

/// Invalidation event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationEvent {
    /// Invalidate a specific key
    Key { key: String },

    /// Invalidate keys matching a glob pattern
    Pattern { pattern: String },

    /// Inventory lists, summaries and inventory statistics
    Inventory,

    /// Invoices and the dashboard/sales statistics derived from them
    Invoices,

    /// Reference data (currencies, units, categories)
    ReferenceData,

    /// All statistics
    Stats,

    UserSession { user_id: String },

    UserPermissions { user_id: String },

    /// A role changed; every user's effective permissions may have changed with it
    RolePermissions { role_id: String },

    /// Session, permissions and token validations of one user
    UserAuth { user_id: String },

    Token { token_id: String },
}

impl InvalidationEvent {
    /// Glob patterns this event expands to
    pub fn patterns(&self) -> Vec<String> {
        match self {
            Self::Key { key } => vec![key.clone()],
            Self::Pattern { pattern } => vec![pattern.clone()],
            Self::Inventory => vec![
                keys::namespace(keys::INVENTORY),
                keys::stats("inventory*"),
            ],
            Self::Invoices => vec![
                keys::namespace(keys::INVOICES),
                keys::stats("dashboard*"),
                keys::stats("sales*"),
            ],
            Self::ReferenceData => vec![keys::namespace(keys::REFERENCE)],
            Self::Stats => vec![keys::namespace(keys::STATS)],
            Self::UserSession { user_id } => vec![keys::user_session(user_id)],
            Self::UserPermissions { user_id } => vec![keys::user_permissions(user_id)],
            Self::RolePermissions { role_id } => vec![
                keys::role_permissions(role_id),
                keys::all_user_permissions(),
            ],
            Self::UserAuth { user_id } => vec![
                keys::user_session(user_id),
                keys::user_permissions(user_id),
                keys::user_tokens(user_id),
            ],
            Self::Token { token_id } => vec![keys::token_any_user(token_id)],
        }
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Key { .. } => "key",
            Self::Pattern { .. } => "pattern",
            Self::Inventory => "inventory",
            Self::Invoices => "invoices",
            Self::ReferenceData => "reference_data",
            Self::Stats => "stats",
            Self::UserSession { .. } => "user_session",
            Self::UserPermissions { .. } => "user_permissions",
            Self::RolePermissions { .. } => "role_permissions",
            Self::UserAuth { .. } => "user_auth",
            Self::Token { .. } => "token",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::glob_to_regex;

    fn matches(event: &InvalidationEvent, key: &str) -> bool {
        event
            .patterns()
            .iter()
            .any(|pattern| glob_to_regex(pattern).unwrap().is_match(key))
    }

    #[test]
    fn test_role_change_clears_all_user_permissions() {
        let event = InvalidationEvent::RolePermissions {
            role_id: "manager".to_string(),
        };
        assert!(matches(&event, &keys::role_permissions("manager")));
        assert!(matches(&event, &keys::user_permissions("42")));
        assert!(!matches(&event, &keys::role_permissions("cashier")));
        assert!(!matches(&event, &keys::user_session("42")));
    }

    #[test]
    fn test_user_auth_is_scoped_to_user() {
        let event = InvalidationEvent::UserAuth {
            user_id: "7".to_string(),
        };
        assert!(matches(&event, &keys::user_session("7")));
        assert!(matches(&event, &keys::user_permissions("7")));
        assert!(matches(&event, &keys::token_validation("7", "abc")));
        assert!(!matches(&event, &keys::token_validation("70", "abc")));
        assert!(!matches(&event, &keys::user_session("8")));
    }

    #[test]
    fn test_token_event_matches_any_user() {
        let event = InvalidationEvent::Token {
            token_id: "abc".to_string(),
        };
        assert!(matches(&event, &keys::token_validation("7", "abc")));
        assert!(!matches(&event, &keys::token_validation("7", "abcd")));
    }

    #[test]
    fn test_namespace_events() {
        assert!(matches(&InvalidationEvent::Inventory, "inventory:list:all|page:1|"));
        assert!(matches(&InvalidationEvent::Inventory, "stats:inventory:value"));
        assert!(!matches(&InvalidationEvent::Inventory, "invoices:1"));

        assert!(matches(&InvalidationEvent::Invoices, "invoices:list:page:1"));
        assert!(matches(&InvalidationEvent::Invoices, "stats:dashboard:today"));
        assert!(!matches(&InvalidationEvent::Invoices, "stats:inventory:value"));

        assert!(matches(&InvalidationEvent::ReferenceData, &keys::reference("currencies")));
    }
}
