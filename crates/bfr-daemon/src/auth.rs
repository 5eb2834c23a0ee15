//! Token verification seam.
//!
//! Real authentication is an external collaborator; the fabric only needs a
//! bearer token to resolve to a user identity. The env-token verifier
//! covers single-tenant deployments and tests; production swaps in the
//! platform's verifier behind the same trait.

use axum::http::HeaderMap;
use uuid::Uuid;

/// The identity a verified token resolves to.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// Extract the bearer token from an `Authorization` header (never the
/// query string).
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Accepts exactly the token in `BIFROST_API_TOKEN`; resolves to a
/// deterministic admin identity derived from the token.
pub struct EnvTokenVerifier {
    token: String,
}

impl EnvTokenVerifier {
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("BIFROST_API_TOKEN").unwrap_or_default(),
        }
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

impl TokenVerifier for EnvTokenVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        if self.token.is_empty() || token != self.token {
            return None;
        }
        // No RNG: the identity is stable for a given token.
        let user_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, token.as_bytes());
        Some(AuthUser {
            user_id,
            name: "API".to_string(),
            email: String::new(),
            is_admin: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-1"));
        assert_eq!(bearer_token(&headers), Some("tok-1"));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn env_verifier_rejects_wrong_and_empty_tokens() {
        let verifier = EnvTokenVerifier::with_token("secret");
        assert!(verifier.verify("secret").is_some());
        assert!(verifier.verify("wrong").is_none());

        let unset = EnvTokenVerifier::with_token("");
        assert!(unset.verify("").is_none());
    }

    #[test]
    fn env_verifier_identity_is_stable() {
        let verifier = EnvTokenVerifier::with_token("secret");
        let a = verifier.verify("secret").unwrap();
        let b = verifier.verify("secret").unwrap();
        assert_eq!(a.user_id, b.user_id);
        assert!(a.is_admin);
    }
}
