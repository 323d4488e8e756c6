use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time;
use tracing::debug;

use crate::error::Result;
use crate::handle::HolderToken;
use crate::store::{LeaseStore, Subscription};

/// One held lease as persisted by the store: the token that owns it plus
/// its expiry stamp. Absence of an entry (or an expired one) means the
/// resource is unlocked.
#[derive(Debug, Clone)]
struct LeaseEntry {
    token: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LeaseEntry {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// In-process implementation of the store primitives.
///
/// Backs tests and single-process deployments. Conditional operations are
/// atomic through DashMap's per-shard entry locking; expired entries are
/// treated as absent at every read, so correctness never depends on the
/// background sweep.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, LeaseEntry>>,
    channels: Arc<DashMap<String, broadcast::Sender<()>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodically drop expired entries so an abandoned key does not pin
    /// memory forever.
    pub fn start_expiry_task(self) {
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                self.sweep_expired();
            }
        });
    }

    fn sweep_expired(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        for entry in self.entries.iter() {
            if entry.value().expires_at <= now {
                expired.push(entry.key().clone());
            }
        }
        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, e| e.expires_at <= now)
                .is_some()
            {
                debug!(key = %key, "expired lease swept");
            }
        }
    }

    /// Token currently holding `key`, if the lease is unexpired.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.entries.get(key).and_then(|e| {
            if e.is_expired() {
                None
            } else {
                Some(e.token.clone())
            }
        })
    }

    /// When the current lease on `key` was taken, if unexpired.
    pub fn acquired_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).and_then(|e| {
            if e.is_expired() {
                None
            } else {
                Some(e.acquired_at)
            }
        })
    }

    /// Drop `key` unconditionally, simulating a store-side eviction.
    pub fn evict(&self, key: &str) {
        self.entries.remove(key);
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<()> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_put(&self, key: &str, token: &HolderToken, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let lease = LeaseEntry {
            token: token.as_str().to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
        };

        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(lease);
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().is_expired() {
                    entry.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn conditional_delete(&self, key: &str, token: &HolderToken) -> Result<bool> {
        let removed = self
            .entries
            .remove_if(key, |_, e| e.token == token.as_str() && !e.is_expired());
        Ok(removed.is_some())
    }

    async fn conditional_extend(
        &self,
        key: &str,
        token: &HolderToken,
        ttl: Duration,
    ) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.token == token.as_str() && !entry.is_expired() => {
                entry.expires_at =
                    Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(&self, channel: &str) -> Result<()> {
        if let Some(tx) = self.channels.get(channel) {
            // No receivers is fine; the wake is best-effort.
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let rx = self.sender(channel).subscribe();
        Ok(Box::new(MemorySubscription { rx: Some(rx) }))
    }
}

struct MemorySubscription {
    rx: Option<broadcast::Receiver<()>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self, timeout: Duration) -> Result<bool> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(false);
        };
        match time::timeout(timeout, rx.recv()).await {
            Ok(Ok(())) => Ok(true),
            // Falling behind means wakes arrived; report one.
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(true),
            Ok(Err(broadcast::error::RecvError::Closed)) => Ok(false),
            Err(_elapsed) => Ok(false),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx = None;
        Ok(())
    }
}
