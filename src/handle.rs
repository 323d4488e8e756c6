use std::fmt;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{LockError, Result};
use crate::renewer::RenewerGuard;

/// Proof of ownership for one acquisition attempt.
///
/// Combines the process id with a random UUID so that a caller whose lease
/// expired and was re-acquired by someone else can never release or extend
/// the new holder's entry. Generated at acquire time, discarded at release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderToken(String);

impl HolderToken {
    pub fn generate() -> Self {
        Self(format!("{}:{}", process::id(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cheap view of a held lease's validity, safe to hand into the critical
/// section. Flips to dead when the watchdog observes the lease lost.
#[derive(Debug, Clone)]
pub struct LeaseProbe {
    alive: Arc<AtomicBool>,
}

impl LeaseProbe {
    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// A successfully acquired lock.
///
/// Owned by the acquiring caller and consumed by `LockManager::release`.
/// Never shared across lock attempts; a fresh handle (with a fresh token)
/// is minted for every acquisition.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: HolderToken,
    acquired_at: DateTime<Utc>,
    lease_time: Duration,
    alive: Arc<AtomicBool>,
    renewer: Option<RenewerGuard>,
}

impl LockHandle {
    pub(crate) fn new(
        key: String,
        token: HolderToken,
        lease_time: Duration,
        alive: Arc<AtomicBool>,
        renewer: Option<RenewerGuard>,
    ) -> Self {
        Self {
            key,
            token,
            acquired_at: Utc::now(),
            lease_time,
            alive,
            renewer,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &HolderToken {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// Whether the lease is still believed held.
    ///
    /// Only the watchdog can observe a loss; without one this stays true
    /// until release even if the TTL has lapsed on the store side.
    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Guard for state mutations inside the critical section: fails with
    /// `LeaseLost` once the watchdog has seen the lease disappear.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(LockError::LeaseLost {
                key: self.key.clone(),
            })
        }
    }

    pub fn probe(&self) -> LeaseProbe {
        LeaseProbe {
            alive: self.alive.clone(),
        }
    }

    pub(crate) fn take_renewer(&mut self) -> Option<RenewerGuard> {
        self.renewer.take()
    }

    pub(crate) fn invalidate(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
