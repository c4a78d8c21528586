//! JWT claims and verification.
//!
//! Signature verification is the external security layer's job; this
//! verifier stands in for its decision contract with a shared-secret
//! check plus issuer and expiry validation. The `jti` claim feeds the
//! token blacklist.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Principal;
use crate::{Error, Result};

/// Claims herald consumes from a verified token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id
    pub sub: String,

    /// Token id, checked against the blacklist
    #[serde(default)]
    pub jti: Option<String>,

    /// Expiry (seconds since epoch)
    pub exp: usize,

    #[serde(default)]
    pub iss: Option<String>,

    /// Granted authorities, e.g. `USER`, `ADMIN`
    #[serde(default)]
    pub authorities: Vec<String>,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub)
            .map_err(|_| Error::unauthorized("Token subject is not a user id"))
    }

    pub fn into_principal(self) -> Result<Principal> {
        Ok(Principal::User {
            id: self.user_id()?,
            authorities: self.authorities,
        })
    }
}

/// Verifier configured from the security settings.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a bearer token and extract its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::unauthorized(format!("Invalid token: {}", e)))
    }
}

/// Pull the bearer token out of an `Authorization` header value.
pub fn extract_bearer(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims() -> Claims {
        Claims {
            sub: Uuid::new_v4().to_string(),
            jti: Some("jti-1".to_string()),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            iss: Some("herald-idp".to_string()),
            authorities: vec!["USER".to_string()],
        }
    }

    #[test]
    fn test_verify_roundtrip() {
        let verifier = JwtVerifier::new("secret", Some("herald-idp"));
        let claims = claims();
        let verified = verifier.verify(&token(&claims, "secret")).unwrap();

        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.authorities, vec!["USER"]);
        assert!(verified.into_principal().unwrap().can_write_notifications());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("secret", None);
        let err = verifier.verify(&token(&claims(), "other")).unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let verifier = JwtVerifier::new("secret", Some("expected-issuer"));
        assert!(verifier.verify(&token(&claims(), "secret")).is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let verifier = JwtVerifier::new("secret", None);
        let mut expired = claims();
        expired.exp = (chrono::Utc::now().timestamp() - 600) as usize;
        assert!(verifier.verify(&token(&expired, "secret")).is_err());
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let verifier = JwtVerifier::new("secret", None);
        let mut bad = claims();
        bad.sub = "service-account".to_string();
        let verified = verifier.verify(&token(&bad, "secret")).unwrap();
        assert!(verified.into_principal().is_err());
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer "), None);
    }
}
