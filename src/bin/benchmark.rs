use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keymutex::{LeaseStore, LockConfig, LockManager, MemoryStore, RedisStore, WaitStrategy};

#[derive(Parser, Debug)]
#[command(name = "keymutex-bench")]
#[command(about = "Lock contention benchmark: spin-poll vs notification-driven waiting")]
struct Args {
    /// Redis URL; the in-process store is used when omitted
    #[arg(long)]
    redis_url: Option<String>,

    /// Number of concurrent workers contending for one key
    #[arg(long, default_value_t = 50)]
    workers: u64,

    /// Simulated critical-section length in milliseconds
    #[arg(long, default_value_t = 20)]
    hold_ms: u64,

    /// Lease TTL in milliseconds
    #[arg(long, default_value_t = 1000)]
    lease_ms: u64,

    /// Per-worker acquisition budget in milliseconds
    #[arg(long, default_value_t = 30_000)]
    wait_timeout_ms: u64,

    /// Run the renewal watchdog while locks are held
    #[arg(long)]
    watchdog: bool,
}

struct Stats {
    acquire_ok: AtomicU64,
    acquire_fail: AtomicU64,
    acquire_latencies: Mutex<Vec<u128>>,
}

impl Stats {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            acquire_ok: AtomicU64::new(0),
            acquire_fail: AtomicU64::new(0),
            acquire_latencies: Mutex::new(Vec::new()),
        })
    }

    fn record_acquire(&self, latency: Duration) {
        self.acquire_ok.fetch_add(1, Ordering::Relaxed);
        self.acquire_latencies
            .lock()
            .unwrap()
            .push(latency.as_micros());
    }
}

fn percentiles(mut v: Vec<u128>) -> (f64, f64, f64, f64) {
    if v.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    v.sort_unstable();
    let n = v.len();
    let avg = v.iter().sum::<u128>() as f64 / n as f64;
    (
        avg,
        v[n * 50 / 100] as f64,
        v[n * 95 / 100] as f64,
        v[n - 1] as f64,
    )
}

/// Every worker deposits once into the same account, guarded by the lock.
/// The balance update is a deliberately non-atomic read-modify-write so a
/// mutual-exclusion failure shows up as lost deposits.
async fn run_strategy(
    label: &str,
    manager: LockManager,
    strategy: WaitStrategy,
    args: &Args,
) -> anyhow::Result<()> {
    const AMOUNT: u64 = 1000;
    let key = format!("bench:account-x:{label}");

    let stats = Stats::new();
    let balance = Arc::new(AtomicU64::new(0));
    let hold = Duration::from_millis(args.hold_ms);

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..args.workers {
        let manager = manager.clone();
        let stats = stats.clone();
        let balance = balance.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let wait_started = Instant::now();
            match manager.acquire(&key, strategy).await {
                Ok(mut handle) => {
                    stats.record_acquire(wait_started.elapsed());
                    let current = balance.load(Ordering::SeqCst);
                    sleep(hold).await;
                    balance.store(current + AMOUNT, Ordering::SeqCst);
                    let _ = manager.release(&mut handle).await;
                }
                Err(_) => {
                    stats.acquire_fail.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for task in tasks {
        task.await?;
    }
    let wall = started.elapsed();

    let ok = stats.acquire_ok.load(Ordering::Relaxed);
    let fail = stats.acquire_fail.load(Ordering::Relaxed);
    let latencies = std::mem::take(&mut *stats.acquire_latencies.lock().unwrap());
    let (avg, p50, p95, max) = percentiles(latencies);

    let expected = ok * AMOUNT;
    let actual = balance.load(Ordering::SeqCst);

    println!("=== {label} ===");
    println!("  wall time      {:.3}s", wall.as_secs_f64());
    println!("  acquired/failed {ok}/{fail}");
    println!(
        "  acquire latency avg {:.1}ms  p50 {:.1}ms  p95 {:.1}ms  max {:.1}ms",
        avg / 1000.0,
        p50 / 1000.0,
        p95 / 1000.0,
        max / 1000.0
    );
    println!("  balance        {actual} (expected {expected})");
    if actual != expected {
        println!("  !! lost deposits: mutual exclusion was violated");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keymutex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let store: Arc<dyn LeaseStore> = match &args.redis_url {
        Some(url) => {
            info!(url = %url, "benchmarking against redis");
            Arc::new(RedisStore::connect(url).await?)
        }
        None => {
            info!("benchmarking against the in-process store");
            let store = MemoryStore::new();
            store.clone().start_expiry_task();
            Arc::new(store)
        }
    };

    let config = LockConfig {
        wait_timeout: Duration::from_millis(args.wait_timeout_ms),
        lease_time: Duration::from_millis(args.lease_ms),
        ..LockConfig::default()
    };
    let mut manager = LockManager::new(store, config);
    if args.watchdog {
        manager = manager.with_watchdog();
    }

    info!(
        workers = args.workers,
        hold_ms = args.hold_ms,
        lease_ms = args.lease_ms,
        "starting contention benchmark"
    );

    run_strategy("spin", manager.clone(), WaitStrategy::Spin, &args).await?;
    run_strategy("notify", manager.clone(), WaitStrategy::Notify, &args).await?;

    Ok(())
}
