use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{LockError, Result};
use crate::handle::{HolderToken, LeaseProbe, LockHandle};
use crate::renewer;
use crate::store::{notify_channel, LeaseStore};
use crate::wait::{self, WaitStrategy};

/// Facade over the store primitives, a wait strategy, and the optional
/// renewal watchdog.
///
/// The store is the only arbiter of mutual exclusion; the manager holds no
/// in-process lock state beyond the handles it mints, so any number of
/// managers (in any number of processes) may contend for the same keys.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    watchdog: bool,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            watchdog: false,
        }
    }

    /// Renew held leases in the background so critical sections longer
    /// than the lease TTL are not silently preempted.
    pub fn with_watchdog(mut self) -> Self {
        self.watchdog = true;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Wait for the lock using the configured budget and lease time.
    pub async fn acquire(&self, key: &str, strategy: WaitStrategy) -> Result<LockHandle> {
        self.acquire_with(
            key,
            strategy,
            self.config.wait_timeout,
            self.config.lease_time,
            &CancellationToken::new(),
        )
        .await
    }

    /// Wait for the lock with an explicit budget, lease time, and
    /// cancellation point.
    pub async fn acquire_with(
        &self,
        key: &str,
        strategy: WaitStrategy,
        wait_timeout: Duration,
        lease_time: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let token = HolderToken::generate();
        match strategy {
            WaitStrategy::Notify => {
                wait::acquire_notify(
                    self.store.as_ref(),
                    key,
                    &token,
                    wait_timeout,
                    lease_time,
                    self.config.notify_poll_fallback,
                    cancel,
                )
                .await?
            }
            WaitStrategy::Spin => {
                wait::acquire_spin(
                    self.store.as_ref(),
                    key,
                    &token,
                    wait_timeout,
                    lease_time,
                    self.config.spin_interval,
                    cancel,
                )
                .await?
            }
        }
        debug!(key, %token, "lock acquired");
        Ok(self.build_handle(key, token, lease_time))
    }

    /// Single zero-wait attempt; `Busy` if the lock is held.
    pub async fn try_acquire(&self, key: &str) -> Result<LockHandle> {
        self.try_acquire_with(key, self.config.lease_time).await
    }

    /// Zero-wait attempt with an explicit lease time.
    pub async fn try_acquire_with(&self, key: &str, lease_time: Duration) -> Result<LockHandle> {
        let token = HolderToken::generate();
        if self.store.try_put(key, &token, lease_time).await? {
            debug!(key, %token, "lock acquired without waiting");
            Ok(self.build_handle(key, token, lease_time))
        } else {
            Err(LockError::Busy)
        }
    }

    /// Release a held lock.
    ///
    /// Stops and joins the watchdog first so no renewal can land after the
    /// delete, then deletes the entry and wakes waiters. The wake is
    /// published even when the entry was already gone; waiters treat it as
    /// a retry hint, never as a correctness signal.
    ///
    /// Returns `LeaseAlreadyLost` when the entry had already expired or
    /// been re-acquired; the resource is unlocked either way, so callers
    /// that only care about "is it released" may treat that as success.
    pub async fn release(&self, handle: &mut LockHandle) -> Result<()> {
        if let Some(guard) = handle.take_renewer() {
            guard.stop().await;
        }

        let deleted = self
            .store
            .conditional_delete(handle.key(), handle.token())
            .await?;

        if let Err(e) = self.store.publish(&notify_channel(handle.key())).await {
            warn!(key = handle.key(), error = %e, "release wake failed");
        }

        handle.invalidate();

        if deleted {
            debug!(key = handle.key(), "lock released");
            Ok(())
        } else {
            debug!(key = handle.key(), "lease already gone at release");
            Err(LockError::LeaseAlreadyLost {
                key: handle.key().to_string(),
            })
        }
    }

    /// Acquire, run `section`, release.
    ///
    /// The closure receives a [`LeaseProbe`] it should consult before any
    /// state mutation the lock guards; once the probe reports dead, the
    /// mutual-exclusion guarantee is gone. A lease that turns out already
    /// lost at release is not surfaced as an error here.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        strategy: WaitStrategy,
        section: F,
    ) -> Result<T>
    where
        F: FnOnce(LeaseProbe) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut handle = self.acquire(key, strategy).await?;
        let output = section(handle.probe()).await;
        match self.release(&mut handle).await {
            Ok(()) | Err(LockError::LeaseAlreadyLost { .. }) => Ok(output),
            Err(e) => Err(e),
        }
    }

    fn build_handle(&self, key: &str, token: HolderToken, lease_time: Duration) -> LockHandle {
        let alive = Arc::new(AtomicBool::new(true));
        let guard = self.watchdog.then(|| {
            renewer::spawn(
                self.store.clone(),
                key.to_string(),
                token.clone(),
                lease_time,
                self.config.renew_interval(lease_time),
                self.config.renew_retry_limit,
                alive.clone(),
            )
        });
        LockHandle::new(key.to_string(), token, lease_time, alive, guard)
    }
}
