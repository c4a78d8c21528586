//! Authentication decision contract.
//!
//! Credential verification proper belongs to an external collaborator;
//! this module consumes its results: a verified JWT becomes a `User`
//! principal, a known service API key becomes a `Service` principal,
//! anything else stays `Anonymous`.

pub mod jwt;

use std::collections::HashMap;

use uuid::Uuid;

pub use jwt::{extract_bearer, Claims, JwtVerifier};

/// Authority granted to an interactive user
pub const AUTHORITY_USER: &str = "USER";
/// Authority required by admin endpoints
pub const AUTHORITY_ADMIN: &str = "ADMIN";
/// Scope a service principal needs to create notifications
pub const SCOPE_NOTIFICATION_SEND: &str = "notification.send";

/// The authenticated actor behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User { id: Uuid, authorities: Vec<String> },
    Service { name: String, scopes: Vec<String> },
    Anonymous,
}

impl Principal {
    /// Writes require a user with the `USER` authority or a service
    /// holding the `notification.send` scope.
    pub fn can_write_notifications(&self) -> bool {
        match self {
            Principal::User { authorities, .. } => {
                authorities.iter().any(|a| a == AUTHORITY_USER || a == AUTHORITY_ADMIN)
            }
            Principal::Service { scopes, .. } => {
                scopes.iter().any(|s| s == SCOPE_NOTIFICATION_SEND)
            }
            Principal::Anonymous => false,
        }
    }

    pub fn is_admin(&self) -> bool {
        match self {
            Principal::User { authorities, .. } => authorities.iter().any(|a| a == AUTHORITY_ADMIN),
            Principal::Service { .. } | Principal::Anonymous => false,
        }
    }

    /// The user id, when the actor is one.
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Principal::User { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Bucket key for the rate limiter.
    pub fn rate_limit_key(&self) -> String {
        match self {
            Principal::User { id, .. } => format!("user:{}", id),
            Principal::Service { name, .. } => format!("service:{}", name),
            Principal::Anonymous => "anonymous".to_string(),
        }
    }
}

/// Registry of service API keys (`SERVICE_API_KEYS_<NAME>` env vars).
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    /// service name (lowercase) -> key
    keys: HashMap<String, String>,
}

impl ApiKeyRegistry {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    /// Verify a key for the named service. Returns the service
    /// principal on success.
    pub fn verify(&self, service: &str, key: &str) -> Option<Principal> {
        let expected = self.keys.get(&service.to_lowercase())?;
        if expected == key {
            Some(Principal::Service {
                name: service.to_lowercase(),
                scopes: vec![SCOPE_NOTIFICATION_SEND.to_string()],
            })
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(authorities: &[&str]) -> Principal {
        Principal::User {
            id: Uuid::new_v4(),
            authorities: authorities.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_write_permissions() {
        assert!(user(&["USER"]).can_write_notifications());
        assert!(user(&["ADMIN"]).can_write_notifications());
        assert!(!user(&["VIEWER"]).can_write_notifications());
        assert!(!Principal::Anonymous.can_write_notifications());

        let service = Principal::Service {
            name: "billing".to_string(),
            scopes: vec![SCOPE_NOTIFICATION_SEND.to_string()],
        };
        assert!(service.can_write_notifications());

        let scopeless = Principal::Service {
            name: "billing".to_string(),
            scopes: vec![],
        };
        assert!(!scopeless.can_write_notifications());
    }

    #[test]
    fn test_admin_requires_user_authority() {
        assert!(user(&["ADMIN"]).is_admin());
        assert!(!user(&["USER"]).is_admin());
        let service = Principal::Service {
            name: "billing".to_string(),
            scopes: vec![SCOPE_NOTIFICATION_SEND.to_string()],
        };
        assert!(!service.is_admin());
    }

    #[test]
    fn test_api_key_registry() {
        let mut keys = HashMap::new();
        keys.insert("billing".to_string(), "secret-1".to_string());
        let registry = ApiKeyRegistry::new(keys);

        let principal = registry.verify("Billing", "secret-1").unwrap();
        assert_eq!(
            principal,
            Principal::Service {
                name: "billing".to_string(),
                scopes: vec![SCOPE_NOTIFICATION_SEND.to_string()],
            }
        );

        assert!(registry.verify("billing", "wrong").is_none());
        assert!(registry.verify("unknown", "secret-1").is_none());
    }

    #[test]
    fn test_rate_limit_keys_distinct() {
        let u = user(&["USER"]);
        let s = Principal::Service {
            name: "billing".to_string(),
            scopes: vec![],
        };
        assert!(u.rate_limit_key().starts_with("user:"));
        assert_eq!(s.rate_limit_key(), "service:billing");
        assert_eq!(Principal::Anonymous.rate_limit_key(), "anonymous");
    }
}
