//! # Token Validation
//!
//! Verifies speaker bearer tokens against the issuer's published signing keys.
//!
//! ## Key Rotation:
//! The issuer rotates its signing keys; the validator keeps a local cache
//! keyed by `kid` and refreshes it only when a token names a key the cache
//! does not hold — not on every call. A `kid` that is still unknown after a
//! refresh is a hard rejection.
//!
//! ## Rejection Rules:
//! Signature invalid, `exp` passed, `aud`/`iss` mismatch, or a `token_use`
//! claim that is not the expected type. "No token at all" is not this layer's
//! concern — the Authorizer treats it as the anonymous listener path.

use crate::error::AuthError;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// The claims a speaker token must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable subject identifier; becomes the speaker principal
    pub sub: String,

    /// Contact address, when the issuer includes one
    #[serde(default)]
    pub email: Option<String>,

    /// Issuer's token-type discriminator
    #[serde(default)]
    pub token_use: String,

    /// Expiry, seconds since epoch
    pub exp: i64,
}

/// Source of the issuer's current signing keys, keyed by `kid`.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn fetch_keys(&self) -> Result<HashMap<String, DecodingKey>, AuthError>;
}

/// Fetches the issuer's JWKS document over HTTPS.
pub struct RemoteKeySet {
    client: reqwest::Client,
    jwks_url: String,
}

impl RemoteKeySet {
    pub fn new(jwks_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            jwks_url,
        }
    }
}

/// Subset of a JWKS entry this validator understands (RSA keys).
#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[async_trait]
impl KeyProvider for RemoteKeySet {
    async fn fetch_keys(&self) -> Result<HashMap<String, DecodingKey>, AuthError> {
        let document: JwksDocument = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::KeyFetch(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in document.keys {
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(err) => {
                    warn!(kid = %jwk.kid, error = %err, "Skipping unusable JWKS entry");
                }
            }
        }
        debug!(key_count = keys.len(), "Refreshed signing key set");
        Ok(keys)
    }
}

/// Fixed key set, used in tests and single-key deployments.
pub struct StaticKeyProvider {
    keys: HashMap<String, DecodingKey>,
}

impl StaticKeyProvider {
    pub fn new(keys: HashMap<String, DecodingKey>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn fetch_keys(&self) -> Result<HashMap<String, DecodingKey>, AuthError> {
        Ok(self.keys.clone())
    }
}

/// Stateless-per-call token verification with a shared key cache.
pub struct TokenValidator {
    provider: Arc<dyn KeyProvider>,
    keys: RwLock<HashMap<String, DecodingKey>>,
    issuer: String,
    audience: String,
    expected_token_use: String,
    algorithm: Algorithm,
}

impl TokenValidator {
    pub fn new(
        provider: Arc<dyn KeyProvider>,
        issuer: String,
        audience: String,
        expected_token_use: String,
    ) -> Self {
        Self {
            provider,
            keys: RwLock::new(HashMap::new()),
            issuer,
            audience,
            expected_token_use,
            algorithm: Algorithm::RS256,
        }
    }

    /// Override the signature algorithm (tests use HS256 secrets).
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Verify a bearer token and return its claims.
    pub async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("token header missing kid".to_string()))?;

        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(self.algorithm);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(token, &key, &validation).map_err(map_decode_error)?;

        if data.claims.token_use != self.expected_token_use {
            return Err(AuthError::WrongTokenUse(data.claims.token_use));
        }

        Ok(data.claims)
    }

    /// Cache lookup with refresh-on-miss. The cache is replaced wholesale on
    /// refresh so rotated-out keys stop verifying.
    async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(key) = self.keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        debug!(kid = %kid, "Signing key cache miss, refreshing");
        let fresh = self.provider.fetch_keys().await?;
        let mut keys = self.keys.write().await;
        *keys = fresh;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidAudience => AuthError::WrongAudience,
        ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
        _ => AuthError::InvalidToken(err.to_string()),
    }
}
