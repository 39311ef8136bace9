//! Token Authentication
//!
//! Validates JWTs from external auth providers; the server never issues
//! tokens. When no key material is configured the server runs in guest
//! mode and accepts any claimed identity, which is the development default.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::network::protocol::AuthRequest;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if token validation is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Standard JWT claims we expect from auth providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject - the player id issued by the auth provider.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Server requires a token and none was sent.
    #[error("token required")]
    MissingToken,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Token subject does not match the claimed player id.
    #[error("subject mismatch")]
    SubjectMismatch,
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Authorize an authentication request. This is the only entry point the
/// connection layer uses.
///
/// Guest mode (no key material configured) accepts any identity. With keys
/// configured, the token must decode against them and its subject must
/// match the claimed player id.
pub fn authorize(request: &AuthRequest, config: &AuthConfig) -> Result<(), AuthError> {
    if !config.is_configured() {
        return Ok(());
    }
    let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;
    let claims = decode_claims(token, config)?;
    if claims.sub != request.player_id {
        return Err(AuthError::SubjectMismatch);
    }
    Ok(())
}

/// Decode a token against the configured key material and verify its
/// claims.
pub fn decode_claims(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => (
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("bad public key: {e}")))?,
            Algorithm::RS256,
        ),
        (None, Some(secret)) => (
            DecodingKey::from_secret(secret.as_bytes()),
            Algorithm::HS256,
        ),
        (None, None) => return Err(AuthError::MissingToken),
    };

    let claims = decode::<TokenClaims>(token, &key, &claim_rules(config, algorithm))
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
            _ => AuthError::DecodeError(e.to_string()),
        })?
        .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    // exp is serde-defaulted to zero when the provider omits it; only a
    // real claim is enforced
    if !config.skip_expiry && claims.exp > 0 && claims.exp < unix_now() {
        return Err(AuthError::Expired);
    }

    Ok(claims)
}

/// Claim checks the decoder enforces. Anything unset in the config is not
/// validated.
fn claim_rules(config: &AuthConfig, algorithm: Algorithm) -> Validation {
    let mut rules = Validation::new(algorithm);
    rules.required_spec_claims = HashSet::new();
    rules.validate_exp = !config.skip_expiry;
    if let Some(ref issuer) = config.issuer {
        rules.set_issuer(&[issuer]);
    }
    match config.audience {
        Some(ref audience) => rules.set_audience(&[audience]),
        None => rules.validate_aud = false,
    }
    rules
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
