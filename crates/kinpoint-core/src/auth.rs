use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Claims carried by a bearer token. Identity is externally issued; only
/// `sub` is required, everything else is best-effort metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Verifies app-minted bearer tokens. With no secret configured every
/// authenticated request is rejected.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Option<String>,
}

impl TokenVerifier {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|secret| !secret.is_empty());
        if secret.is_none() {
            tracing::warn!("no token secret configured; all connections will be rejected");
        }
        Self { secret }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, CoreError> {
        let Some(secret) = &self.secret else {
            return Err(CoreError::Unauthenticated);
        };
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| CoreError::Unauthenticated)
    }
}

/// Strip the `Bearer ` scheme off an Authorization header value.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &str, sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() as usize + 3600,
            iat: chrono::Utc::now().timestamp() as usize,
            full_name: Some("Test User".into()),
            age: None,
            date_of_birth: None,
            roles: None,
            permissions: None,
            family_ids: Some(vec!["fA".into()]),
            parent_id: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_own_tokens() {
        let verifier = TokenVerifier::new(Some("test-secret".into()));
        let claims = verifier.verify(&mint("test-secret", "u1")).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.family_ids.as_deref(), Some(&["fA".to_string()][..]));
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = TokenVerifier::new(Some("test-secret".into()));
        assert!(verifier.verify(&mint("other-secret", "u1")).is_err());
    }

    #[test]
    fn rejects_everything_without_secret() {
        let verifier = TokenVerifier::new(None);
        assert!(verifier.verify(&mint("test-secret", "u1")).is_err());
        let verifier = TokenVerifier::new(Some(String::new()));
        assert!(verifier.verify(&mint("", "u1")).is_err());
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_from_header("Bearer abc.def"), Some("abc.def"));
        assert_eq!(bearer_from_header("Basic abc"), None);
        assert_eq!(bearer_from_header("Bearer "), None);
    }
}
