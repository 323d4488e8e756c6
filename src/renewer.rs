use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handle::HolderToken;
use crate::store::LeaseStore;

/// Owns one spawned renewal task, lifecycle-bound to its lock handle.
///
/// Release must call [`stop`](RenewerGuard::stop) before deleting the
/// entry: cancel-then-join guarantees no extend is in flight when the
/// delete lands, so a late renewal can never resurrect the TTL under a
/// caller that re-acquired the key afterwards.
#[derive(Debug)]
pub(crate) struct RenewerGuard {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RenewerGuard {
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "lease renewal task panicked");
        }
    }
}

/// Start the watchdog for a freshly acquired lease.
///
/// Every `interval` it re-extends the lease to `lease_time`. A clean
/// "token no longer there" answer means the lease is lost: the shared
/// alive flag is cleared and the task exits. Transport errors are retried
/// up to `retry_limit` consecutive times before being treated the same.
pub(crate) fn spawn(
    store: Arc<dyn LeaseStore>,
    key: String,
    token: HolderToken,
    lease_time: Duration,
    interval: Duration,
    retry_limit: u32,
    alive: Arc<AtomicBool>,
) -> RenewerGuard {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        renew_loop(
            store,
            &key,
            &token,
            lease_time,
            interval,
            retry_limit,
            alive,
            task_cancel,
        )
        .await;
    });
    RenewerGuard { cancel, task }
}

#[allow(clippy::too_many_arguments)]
async fn renew_loop(
    store: Arc<dyn LeaseStore>,
    key: &str,
    token: &HolderToken,
    lease_time: Duration,
    interval: Duration,
    retry_limit: u32,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(interval) => {}
        }

        match store.conditional_extend(key, token, lease_time).await {
            Ok(true) => {
                consecutive_failures = 0;
                debug!(key, "lease renewed");
            }
            Ok(false) => {
                warn!(key, "lease lost: entry expired or re-acquired elsewhere");
                alive.store(false, Ordering::Release);
                return;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    key,
                    attempt = consecutive_failures,
                    error = %e,
                    "lease renewal failed"
                );
                if consecutive_failures >= retry_limit {
                    warn!(key, "giving up renewing after repeated store failures");
                    alive.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LockError, Result};
    use crate::memory::MemoryStore;
    use crate::store::Subscription;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const INTERVAL: Duration = Duration::from_millis(25);

    #[tokio::test]
    async fn test_watchdog_outlives_original_ttl() {
        let store = Arc::new(MemoryStore::new());
        let token = HolderToken::generate();
        let lease = Duration::from_millis(80);
        store.try_put("account-x", &token, lease).await.unwrap();

        let alive = Arc::new(AtomicBool::new(true));
        let guard = spawn(
            store.clone(),
            "account-x".to_string(),
            token.clone(),
            lease,
            INTERVAL,
            3,
            alive.clone(),
        );

        // Several original TTLs pass; the lease must still be held.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(store.holder("account-x"), Some(token.as_str().to_string()));
        assert!(alive.load(Ordering::Acquire));

        guard.stop().await;
    }

    #[tokio::test]
    async fn test_watchdog_flags_lost_lease() {
        let store = Arc::new(MemoryStore::new());
        let token = HolderToken::generate();
        let lease = Duration::from_secs(10);
        store.try_put("account-x", &token, lease).await.unwrap();

        let alive = Arc::new(AtomicBool::new(true));
        let guard = spawn(
            store.clone(),
            "account-x".to_string(),
            token.clone(),
            lease,
            INTERVAL,
            3,
            alive.clone(),
        );

        // The entry vanishes behind the watchdog's back.
        store.evict("account-x");

        sleep(INTERVAL * 4).await;
        assert!(!alive.load(Ordering::Acquire));

        guard.stop().await;
    }

    /// Fails `conditional_extend` a set number of times, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl LeaseStore for FlakyStore {
        async fn try_put(&self, key: &str, token: &HolderToken, ttl: Duration) -> Result<bool> {
            self.inner.try_put(key, token, ttl).await
        }

        async fn conditional_delete(&self, key: &str, token: &HolderToken) -> Result<bool> {
            self.inner.conditional_delete(key, token).await
        }

        async fn conditional_extend(
            &self,
            key: &str,
            token: &HolderToken,
            ttl: Duration,
        ) -> Result<bool> {
            let left = self.failures_left.load(Ordering::Acquire);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::Release);
                return Err(LockError::StoreUnavailable(anyhow::anyhow!(
                    "injected transport failure"
                )));
            }
            self.inner.conditional_extend(key, token, ttl).await
        }

        async fn publish(&self, channel: &str) -> Result<()> {
            self.inner.publish(channel).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn test_transient_extend_failures_are_tolerated() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(2),
        });
        let token = HolderToken::generate();
        let lease = Duration::from_millis(200);
        store.try_put("account-x", &token, lease).await.unwrap();

        let alive = Arc::new(AtomicBool::new(true));
        let guard = spawn(
            store.clone(),
            "account-x".to_string(),
            token.clone(),
            lease,
            INTERVAL,
            3,
            alive.clone(),
        );

        // Two injected failures fit under the limit of three; once they
        // pass, renewals resume and the lease stays alive.
        sleep(Duration::from_millis(300)).await;
        assert!(alive.load(Ordering::Acquire));
        assert_eq!(
            store.inner.holder("account-x"),
            Some(token.as_str().to_string())
        );

        guard.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_extend_failures_escalate_to_lost() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let token = HolderToken::generate();
        let lease = Duration::from_secs(10);
        store.try_put("account-x", &token, lease).await.unwrap();

        let alive = Arc::new(AtomicBool::new(true));
        let guard = spawn(
            store.clone(),
            "account-x".to_string(),
            token.clone(),
            lease,
            INTERVAL,
            3,
            alive.clone(),
        );

        sleep(INTERVAL * 6).await;
        assert!(!alive.load(Ordering::Acquire));

        guard.stop().await;
    }
}
