use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::handle::HolderToken;

/// Prefix for per-resource release notification channels.
pub const NOTIFY_CHANNEL_PREFIX: &str = "lock-notify:";

/// Name of the notification channel for a resource key.
pub fn notify_channel(key: &str) -> String {
    format!("{NOTIFY_CHANNEL_PREFIX}{key}")
}

/// Atomic primitives the external key-value store must provide.
///
/// Every operation is a single round trip against the store; an
/// implementation must never emulate one with a client-side
/// read-modify-write sequence, since the store is the only arbiter of
/// mutual exclusion. Transport failures surface as
/// [`LockError::StoreUnavailable`](crate::LockError::StoreUnavailable),
/// never as a false "lock busy".
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// `SET key token NX PX ttl`: create the entry only if no unexpired
    /// entry exists. Returns false when the lock is held.
    async fn try_put(&self, key: &str, token: &HolderToken, ttl: Duration) -> Result<bool>;

    /// Delete the entry only while it still holds `token`. Returns false
    /// if the entry is absent or owned by a different token.
    async fn conditional_delete(&self, key: &str, token: &HolderToken) -> Result<bool>;

    /// Reset the TTL only while the entry still holds `token`. Returns
    /// false once the lease has been lost.
    async fn conditional_extend(&self, key: &str, token: &HolderToken, ttl: Duration)
        -> Result<bool>;

    /// Broadcast a release wake on `channel`. Best-effort and unordered;
    /// consumers must tolerate dropped and duplicated deliveries.
    async fn publish(&self, channel: &str) -> Result<()>;

    /// Open a wake-event source for `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;
}

/// A live subscription to one resource's notification channel, owned by a
/// blocked waiter for the duration of its wait.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for a wake. Returns true if one arrived,
    /// false on timeout or after `unsubscribe`.
    async fn recv(&mut self, timeout: Duration) -> Result<bool>;

    /// Tear the subscription down. Idempotent.
    async fn unsubscribe(&mut self) -> Result<()>;
}
