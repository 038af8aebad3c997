//! Bearer token verification. The API accepts either configured static
//! tokens or RS256 JWTs signed by the identity provider.

use std::collections::HashSet;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerIdentity {
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid authentication credentials")]
    InvalidToken,
    #[error("token has no username claim")]
    MissingUsername,
    #[error("invalid verification key: {0}")]
    InvalidKey(String),
}

pub trait AuthProvider: Send + Sync {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError>;
}

/// Fixed API tokens, compared verbatim.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuth {
    tokens: HashSet<String>,
}

impl StaticTokenAuth {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthProvider for StaticTokenAuth {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        if !self.tokens.contains(token) {
            return Err(AuthError::InvalidToken);
        }
        Ok(CallerIdentity {
            username: "api-token".to_string(),
            email: None,
            roles: vec!["api".to_string()],
        })
    }
}

#[derive(Debug, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    preferred_username: Option<String>,
    email: Option<String>,
    realm_access: Option<RealmAccess>,
}

pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    /// Accepts a full PEM or the bare base64 body identity providers
    /// publish for their realm key.
    pub fn rs256(public_key: &str) -> Result<Self, AuthError> {
        let trimmed = public_key.trim();
        let pem = if trimmed.starts_with("-----BEGIN") {
            trimmed.to_string()
        } else {
            format!("-----BEGIN PUBLIC KEY-----\n{trimmed}\n-----END PUBLIC KEY-----")
        };
        let key = DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        Ok(Self { key, validation })
    }
}

impl AuthProvider for JwtAuth {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            tracing::debug!(error = %err, "jwt rejected");
            AuthError::InvalidToken
        })?;
        let claims = data.claims;
        let username = claims.preferred_username.ok_or(AuthError::MissingUsername)?;
        Ok(CallerIdentity {
            username,
            email: claims.email,
            roles: claims.realm_access.map(|r| r.roles).unwrap_or_default(),
        })
    }
}

/// Tries each provider in turn; the first acceptance wins.
pub struct AnyOf {
    providers: Vec<Box<dyn AuthProvider>>,
}

impl AnyOf {
    pub fn new(providers: Vec<Box<dyn AuthProvider>>) -> Self {
        Self { providers }
    }
}

impl AuthProvider for AnyOf {
    fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let mut last = AuthError::InvalidToken;
        for provider in &self.providers {
            match provider.verify(token) {
                Ok(identity) => return Ok(identity),
                Err(err) => last = err,
            }
        }
        Err(last)
    }
}

/// `Bearer <token>` from an Authorization header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingToken)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token.trim())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::path::PathBuf;

    fn fixture(name: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/auth")
            .join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
    }

    pub(crate) fn public_key() -> String {
        fixture("test_public_key.pem")
    }

    pub(crate) fn signed_token(claims: serde_json::Value) -> String {
        let key = EncodingKey::from_rsa_pem(fixture("test_signing_key.pem").as_bytes()).unwrap();
        encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn rs256_token_yields_identity() {
        let auth = JwtAuth::rs256(&public_key()).unwrap();
        let token = signed_token(serde_json::json!({
            "preferred_username": "analyst",
            "email": "analyst@example.com",
            "realm_access": {"roles": ["viewer"]},
            "aud": "screener-client",
            "exp": exp(),
        }));
        let identity = auth.verify(&token).unwrap();
        assert_eq!(identity.username, "analyst");
        assert_eq!(identity.email.as_deref(), Some("analyst@example.com"));
        assert_eq!(identity.roles, vec!["viewer"]);
    }

    #[test]
    fn bare_base64_key_is_accepted() {
        let body = public_key()
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<String>();
        assert!(JwtAuth::rs256(&body).is_ok());
    }

    #[test]
    fn expired_tampered_or_anonymous_tokens_fail() {
        let auth = JwtAuth::rs256(&public_key()).unwrap();
        let expired = signed_token(serde_json::json!({"preferred_username": "a", "exp": 1_000}));
        assert!(matches!(auth.verify(&expired), Err(AuthError::InvalidToken)));

        let mut tampered = signed_token(serde_json::json!({"preferred_username": "a", "exp": exp()}));
        tampered.push('x');
        assert!(matches!(auth.verify(&tampered), Err(AuthError::InvalidToken)));

        let anonymous = signed_token(serde_json::json!({"exp": exp()}));
        assert!(matches!(auth.verify(&anonymous), Err(AuthError::MissingUsername)));
    }

    #[test]
    fn static_tokens_and_fallthrough() {
        let auth = AnyOf::new(vec![
            Box::new(StaticTokenAuth::new(["secret-1", ""])),
            Box::new(JwtAuth::rs256(&public_key()).unwrap()),
        ]);
        assert_eq!(auth.verify("secret-1").unwrap().username, "api-token");
        assert!(auth.verify("").is_err());
        let jwt = signed_token(serde_json::json!({"preferred_username": "b", "exp": exp()}));
        assert_eq!(auth.verify(&jwt).unwrap().username, "b");
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_token(Some("bearer  abc ")).unwrap(), "abc");
        assert!(bearer_token(Some("Basic abc")).is_err());
        assert!(bearer_token(Some("Bearer ")).is_err());
        assert!(bearer_token(None).is_err());
    }
}
