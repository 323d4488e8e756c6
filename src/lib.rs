//! Distributed mutual-exclusion locks over a shared key-value store.
//!
//! The store arbitrates exclusion through atomic primitives: conditional
//! set with TTL, token-checked delete and extend, and pub/sub wakes. This
//! crate layers the locking protocol on top. Waiters either block on the
//! holder's release notification or spin-poll on an interval, leases
//! expire so a crashed holder cannot deadlock the key, and an optional
//! watchdog renews long-held leases and surfaces lease loss instead of
//! letting a critical section keep running unguarded.

pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
pub mod memory;
pub mod redis;
mod renewer;
pub mod store;
pub mod wait;

pub use config::LockConfig;
pub use error::{LockError, Result};
pub use handle::{HolderToken, LeaseProbe, LockHandle};
pub use manager::LockManager;
pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use store::{notify_channel, LeaseStore, Subscription};
pub use wait::WaitStrategy;
