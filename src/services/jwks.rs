// src/services/jwks.rs
//! Signing-key resolution against the identity provider's published JWKS.
//!
//! The fetched key set is cached process-wide. Races during population are
//! tolerated: duplicate fetches are harmless and the last write wins.

use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum KeyResolverError {
    #[error("key set unreachable: {0}")]
    Fetch(String),
    #[error("no signing key matches kid `{0}`")]
    UnknownKey(String),
}

/// A decoding key plus the algorithm it verifies.
#[derive(Clone)]
pub struct ResolvedKey {
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Resolves token signing keys by key ID.
///
/// Injectable so tests substitute a deterministic in-memory key set; the
/// explicit `invalidate` exists for key-rotation suspicion.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey, KeyResolverError>;
    /// Drop any cached key set so the next resolve re-fetches.
    async fn invalidate(&self);
}

/// Fetches and caches the provider JWKS over HTTP.
pub struct RemoteKeyResolver {
    http: Client,
    jwks_url: String,
    fetch_timeout: Duration,
    cache: RwLock<Option<JwkSet>>,
}

impl RemoteKeyResolver {
    pub fn new(http: Client, jwks_url: String) -> Self {
        Self {
            http,
            jwks_url,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            cache: RwLock::new(None),
        }
    }

    async fn fetch_key_set(&self) -> Result<JwkSet, KeyResolverError> {
        debug!(url = %self.jwks_url, "Fetching identity provider key set");
        let response = self
            .http
            .get(&self.jwks_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, url = %self.jwks_url, "JWKS fetch failed");
                KeyResolverError::Fetch(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(http_status = %status, url = %self.jwks_url, "JWKS endpoint returned error status");
            return Err(KeyResolverError::Fetch(format!(
                "jwks endpoint returned {}",
                status
            )));
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|e| KeyResolverError::Fetch(format!("malformed jwks payload: {}", e)))
    }

    fn find_key(set: &JwkSet, key_id: &str) -> Option<ResolvedKey> {
        let jwk = set.keys.iter().find(|k| {
            k.common
                .key_id
                .as_deref()
                .map(|kid| bool::from(kid.as_bytes().ct_eq(key_id.as_bytes())))
                .unwrap_or(false)
        })?;
        let key = DecodingKey::from_jwk(jwk).ok()?;
        Some(ResolvedKey {
            key,
            algorithm: jwk_algorithm(jwk),
        })
    }
}

/// Algorithm from the JWK's `alg` parameter, falling back to the key
/// type's conventional algorithm when the provider omits it.
fn jwk_algorithm(jwk: &Jwk) -> Algorithm {
    if let Some(alg) = jwk.common.algorithm.as_ref() {
        return *alg;
    }
    match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(_) => Algorithm::ES256,
        AlgorithmParameters::OctetKeyPair(_) => Algorithm::EdDSA,
        AlgorithmParameters::OctetKey(_) => Algorithm::HS256,
        _ => Algorithm::RS256,
    }
}

#[async_trait]
impl KeyResolver for RemoteKeyResolver {
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey, KeyResolverError> {
        if let Some(set) = self.cache.read().await.as_ref() {
            if let Some(found) = Self::find_key(set, key_id) {
                return Ok(found);
            }
        }

        // Cache miss or unknown kid: re-fetch once so a provider key
        // rotation cannot permanently strand a stale cache.
        let fresh = self.fetch_key_set().await?;
        let found = Self::find_key(&fresh, key_id);
        *self.cache.write().await = Some(fresh);

        found.ok_or_else(|| KeyResolverError::UnknownKey(key_id.to_string()))
    }

    async fn invalidate(&self) {
        debug!("Invalidating cached key set");
        *self.cache.write().await = None;
    }
}

/// Deterministic in-memory resolver for tests and local development.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, ResolvedKey>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_id: &str, key: DecodingKey, algorithm: Algorithm) -> Self {
        self.keys
            .insert(key_id.to_string(), ResolvedKey { key, algorithm });
        self
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey, KeyResolverError> {
        self.keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| KeyResolverError::UnknownKey(key_id.to_string()))
    }

    async fn invalidate(&self) {}
}
