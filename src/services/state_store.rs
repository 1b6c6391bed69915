// src/services/state_store.rs
//! Single-use, short-TTL state for the OAuth round-trip.
//!
//! The in-memory implementation covers a single server instance and does
//! not survive restarts; multi-instance deployments plug an externally
//! keyed store in behind the trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: String, value: String, ttl: Duration);

    /// Remove and return the value for `key`. A key can be consumed at
    /// most once; expired entries behave as absent.
    async fn consume(&self, key: &str) -> Option<String>;
}

struct StateEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, StateEntry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired state entries");
        }
    }

    /// Spawn the periodic sweep so abandoned logins do not accumulate.
    pub fn start_sweep_task(store: Arc<InMemoryStateStore>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                store.sweep_expired().await;
            }
        });
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, key: String, value: String, ttl: Duration) {
        let entry = StateEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key, entry);
    }

    async fn consume(&self, key: &str) -> Option<String> {
        let entry = self.entries.write().await.remove(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value)
    }
}
