//! Auth Gate
//!
//! Validates the bearer token a client presents on the upgrade request and
//! resolves the connection identity from its claims. Connections are only
//! admitted into the hub after a successful [`Authenticator::authenticate`].
//!
//! Two token shapes are accepted. Tokens minted by the REST service carry the
//! identity in `id`; tokens minted by `queuecast-cli token` carry it in
//! `user_id`. Resolution walks [`IDENTITY_PRECEDENCE`] and the first non-empty
//! string wins.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Authenticated connection identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Errors raised while admitting a connection
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token missing")]
    MissingToken,

    #[error("token verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token carries no id or user_id claim")]
    MissingIdentity,

    #[error("token lifetime out of range")]
    InvalidLifetime,
}

/// Capability that turns a bearer token into an [`Identity`]
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Claim fields that may carry the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityClaim {
    /// `id`, written by the REST service
    Id,
    /// `user_id`, written by this service's token tool
    UserId,
}

/// Resolution order for identity claims
pub const IDENTITY_PRECEDENCE: [IdentityClaim; 2] = [IdentityClaim::Id, IdentityClaim::UserId];

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
}

impl TokenClaims {
    fn claim(&self, which: IdentityClaim) -> Option<&str> {
        let value = match which {
            IdentityClaim::Id => self.id.as_ref(),
            IdentityClaim::UserId => self.user_id.as_ref(),
        };
        match value {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    fn resolve_identity(&self) -> Result<Identity, AuthError> {
        IDENTITY_PRECEDENCE
            .iter()
            .find_map(|which| self.claim(*which))
            .map(Identity::new)
            .ok_or(AuthError::MissingIdentity)
    }
}

/// Claims written by [`JwtAuthenticator::issue`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedClaims {
    pub user_id: String,
    pub rol: String,
    pub exp: i64,
}

/// HMAC-signed JWT validation with an explicitly supplied secret
#[derive(Clone)]
pub struct JwtAuthenticator {
    enc: EncodingKey,
    dec: DecodingKey,
    leeway_secs: u64,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
            leeway_secs: 0,
        }
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Sign an HS256 token for `user_id` valid for `ttl`
    pub fn issue(&self, user_id: &str, role: &str, ttl: Duration) -> Result<String, AuthError> {
        let claims = IssuedClaims {
            user_id: user_id.to_string(),
            rol: role.to_string(),
            exp: Utc::now()
                .checked_add_signed(ttl)
                .ok_or(AuthError::InvalidLifetime)?
                .timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.enc)?;
        Ok(token)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // exp is checked when present; REST tokens without one are still accepted
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = self.leeway_secs;
        validation
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.dec, &self.validation())?;
        data.claims.resolve_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, claims: &Value) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn issued_token_resolves_user_id() {
        let auth = JwtAuthenticator::new("test-secret");
        let token = auth.issue("cliente1", "cliente", Duration::minutes(15)).unwrap();
        assert_eq!(auth.authenticate(&token).unwrap(), Identity::from("cliente1"));
    }

    #[test]
    fn id_claim_wins_over_user_id() {
        let auth = JwtAuthenticator::new("s");
        let token = sign("s", &json!({"id": "rest-7", "user_id": "ws-7"}));
        assert_eq!(auth.authenticate(&token).unwrap().as_str(), "rest-7");
    }

    #[test]
    fn empty_id_falls_through_to_user_id() {
        let auth = JwtAuthenticator::new("s");
        let token = sign("s", &json!({"id": "", "user_id": "ws-7"}));
        assert_eq!(auth.authenticate(&token).unwrap().as_str(), "ws-7");

        let token = sign("s", &json!({"id": 42, "user_id": "ws-8"}));
        assert_eq!(auth.authenticate(&token).unwrap().as_str(), "ws-8");
    }

    #[test]
    fn missing_identity_rejected() {
        let auth = JwtAuthenticator::new("s");
        let token = sign("s", &json!({"rol": "admin"}));
        assert!(matches!(
            auth.authenticate(&token),
            Err(AuthError::MissingIdentity)
        ));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = JwtAuthenticator::new("one")
            .issue("u", "cliente", Duration::minutes(1))
            .unwrap();
        let err = JwtAuthenticator::new("two").authenticate(&token).unwrap_err();
        assert!(matches!(err, AuthError::Jwt(_)));
    }

    #[test]
    fn expired_token_rejected() {
        let auth = JwtAuthenticator::new("s");
        let token = auth.issue("u", "cliente", Duration::minutes(-10)).unwrap();
        assert!(matches!(auth.authenticate(&token), Err(AuthError::Jwt(_))));
    }

    #[test]
    fn oversized_lifetime_is_an_error() {
        let auth = JwtAuthenticator::new("s");
        let err = auth
            .issue("u", "cliente", Duration::days(1_000_000_000))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidLifetime));
    }

    #[test]
    fn blank_and_garbage_tokens_rejected() {
        let auth = JwtAuthenticator::new("s");
        assert!(matches!(auth.authenticate("  "), Err(AuthError::MissingToken)));
        assert!(matches!(auth.authenticate("not.a.jwt"), Err(AuthError::Jwt(_))));
    }
}
