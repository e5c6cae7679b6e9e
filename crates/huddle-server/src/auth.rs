//! Connection authentication.

use huddle_core::PrincipalId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("failed to issue token: {0}")]
    Issue(String),
}

/// Ten years.
const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

/// Resolves a bearer token to the principal it was issued for.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<PrincipalId, AuthError>;
}

/// JWT claims carried by huddle tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub user_id: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// HS256 token issuer and verifier.
#[derive(Clone)]
pub struct JwtAuthenticator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl: chrono::Duration,
}

impl JwtAuthenticator {
    pub fn new(secret: &str, issuer: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            ttl: chrono::Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
        }
    }

    pub fn issue(&self, principal: &PrincipalId) -> Result<String, AuthError> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: principal.to_string(),
            user_id: principal.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AuthError::Issue(e.to_string()))
    }

    /// Verify signature, expiry and issuer.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<PrincipalId, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims = self.verify(token)?;
        if claims.user_id.is_empty() {
            return Err(AuthError::InvalidToken("empty user_id claim".into()));
        }
        Ok(PrincipalId::from_raw(claims.user_id))
    }
}

/// Token from an `Authorization` header value. Accepts a raw token too.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    (!token.is_empty()).then_some(token)
}
