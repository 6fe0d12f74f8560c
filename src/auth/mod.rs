//! Token Validator.
//!
//! Verifies bearer tokens identically to the REST path by resolving the
//! signing secret through a single `SecretResolver` — sharing that resolver
//! between REST and WebSocket avoids the two paths validating differently.
//! Validated claims are cached by token hash with a TTL capped at
//! `min(60s, remaining token lifetime)`.

use crate::error::GatewayError;
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }
}

/// Resolves the signing secret used to verify bearer tokens. Production
/// deployments implement this against the same source the REST auth path
/// reads from; tests and single-node deployments can use
/// [`InMemorySecretResolver`]. Modeled as an explicit trait rather than a
/// global so it can be handed to `Core` at construction time.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self) -> Result<String, GatewayError>;
}

/// A resolver backed by a single in-memory secret. Suitable for tests and
/// for deployments where REST and WS share one process and one HMAC key.
pub struct InMemorySecretResolver {
    secret: String,
}

impl InMemorySecretResolver {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl SecretResolver for InMemorySecretResolver {
    async fn resolve(&self) -> Result<String, GatewayError> {
        Ok(self.secret.clone())
    }
}

struct CacheEntry {
    claims: Claims,
    expires_at: Instant,
}

/// Verifies bearer tokens and caches validated claims by token hash.
pub struct TokenValidator {
    resolver: Arc<dyn SecretResolver>,
    cache: RwLock<HashMap<[u8; 32], CacheEntry>>,
    cache_ttl: Duration,
}

impl TokenValidator {
    pub fn new(resolver: Arc<dyn SecretResolver>, cache_ttl: Duration) -> Self {
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
        }
    }

    /// Validate a bearer token, returning its claims.
    ///
    /// Error kinds: `AuthMalformed` (structure), `AuthInvalid`
    /// (missing/expired/signature), `AuthUnavailable` (the secret resolver
    /// stayed unreachable through its own internal backoff — treat as a
    /// transient failure, never as a rejection).
    pub async fn validate(&self, token: &str) -> Result<Claims, GatewayError> {
        if token.trim().is_empty() {
            return Err(GatewayError::AuthMalformed);
        }

        let hash = hash_token(token);
        if let Some(claims) = self.cached(&hash).await {
            return Ok(claims);
        }

        let secret = retry_with_backoff(&RetryConfig::default(), || self.resolver.resolve())
            .await
            .map_err(|_| {
                warn!("secret resolver unavailable after retries");
                GatewayError::AuthUnavailable("secret resolver failure".into())
            })?;

        let claims = decode_and_verify(token, &secret)?;

        let now = chrono::Utc::now().timestamp();
        let remaining = (claims.exp - now).max(0) as u64;
        let ttl = self.cache_ttl.min(Duration::from_secs(remaining));
        self.cache.write().await.insert(
            hash,
            CacheEntry {
                claims: claims.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(claims)
    }

    async fn cached(&self, hash: &[u8; 32]) -> Option<Claims> {
        let cache = self.cache.read().await;
        let entry = cache.get(hash)?;
        if entry.expires_at > Instant::now() {
            Some(entry.claims.clone())
        } else {
            None
        }
    }

    /// Drop expired cache entries. Intended to be called periodically by a
    /// background task so the cache doesn't grow unbounded between lookups.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        self.cache.write().await.retain(|_, e| e.expires_at > now);
    }
}

fn decode_and_verify(token: &str, secret: &str) -> Result<Claims, GatewayError> {
    use jsonwebtoken::{decode, DecodingKey, Validation};

    let mut validation = Validation::default();
    validation.validate_exp = true;

    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidToken => GatewayError::AuthMalformed,
            _ => GatewayError::AuthInvalid,
        })
}

fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Extract a bearer token from the handshake in the priority order:
/// `Authorization: Bearer <jwt>`, then `sec-websocket-protocol`, then the
/// discouraged `?token=` query parameter.
pub fn extract_token(
    authorization: Option<&str>,
    subprotocols: &[String],
    query_token: Option<&str>,
) -> Option<String> {
    if let Some(header) = authorization {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    for proto in subprotocols {
        if let Some(token) = proto.strip_prefix("token.") {
            return Some(token.to_string());
        }
    }
    query_token.map(|t| t.to_string())
}
