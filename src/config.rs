use std::env;
use std::time::Duration;

/// Tunables for lock acquisition and lease maintenance.
///
/// Durations are taken from the environment as millisecond values; every
/// option has a usable default so a `LockConfig::default()` works out of
/// the box.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Longest time `acquire` waits for a contended lock before giving up.
    pub wait_timeout: Duration,
    /// TTL of a held lease; the store expires the entry after this long
    /// without a renewal.
    pub lease_time: Duration,
    /// Fraction of `lease_time` between watchdog renewal attempts.
    /// Must be in (0, 1).
    pub renew_interval_fraction: f64,
    /// Delay between attempts for the spin strategy.
    pub spin_interval: Duration,
    /// Safety-net poll interval for notify waiters; covers dropped or
    /// duplicated release notifications.
    pub notify_poll_fallback: Duration,
    /// Consecutive transient renewal failures tolerated before the
    /// watchdog treats the lease as lost.
    pub renew_retry_limit: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            lease_time: Duration::from_secs(30),
            renew_interval_fraction: 1.0 / 3.0,
            spin_interval: Duration::from_millis(100),
            notify_poll_fallback: Duration::from_secs(1),
            renew_retry_limit: 3,
        }
    }
}

impl LockConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            wait_timeout: env_duration_ms("KEYMUTEX_WAIT_TIMEOUT_MS", defaults.wait_timeout)?,
            lease_time: env_duration_ms("KEYMUTEX_LEASE_TIME_MS", defaults.lease_time)?,
            renew_interval_fraction: match env::var("KEYMUTEX_RENEW_FRACTION") {
                Ok(raw) => raw
                    .parse::<f64>()
                    .map_err(|_| anyhow::anyhow!("KEYMUTEX_RENEW_FRACTION must be a float"))?,
                Err(_) => defaults.renew_interval_fraction,
            },
            spin_interval: env_duration_ms("KEYMUTEX_SPIN_INTERVAL_MS", defaults.spin_interval)?,
            notify_poll_fallback: env_duration_ms(
                "KEYMUTEX_NOTIFY_POLL_FALLBACK_MS",
                defaults.notify_poll_fallback,
            )?,
            renew_retry_limit: match env::var("KEYMUTEX_RENEW_RETRY_LIMIT") {
                Ok(raw) => raw
                    .parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("KEYMUTEX_RENEW_RETRY_LIMIT must be an integer"))?,
                Err(_) => defaults.renew_retry_limit,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.renew_interval_fraction <= 0.0 || self.renew_interval_fraction >= 1.0 {
            anyhow::bail!(
                "renew_interval_fraction must be in (0, 1), got {}",
                self.renew_interval_fraction
            );
        }
        if self.lease_time.is_zero() {
            anyhow::bail!("lease_time must be non-zero");
        }
        Ok(())
    }

    /// Watchdog renewal period for a given lease.
    pub fn renew_interval(&self, lease_time: Duration) -> Duration {
        lease_time.mul_f64(self.renew_interval_fraction)
    }
}

fn env_duration_ms(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be an integer millisecond value", name))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(default),
    }
}
