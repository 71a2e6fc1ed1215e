//! `latchkey contend`: workers competing for one key

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, ensure};
use clap::Args;
use latchkey_lock::{AutoRenewal, LockManager, RetryPolicy, RetryingLockManager};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Args)]
pub struct ContendArgs {
    /// Number of concurrent workers
    #[arg(short = 'w', long, default_value_t = 8)]
    pub workers: usize,
    /// Critical sections each worker enters
    #[arg(short = 'n', long, default_value_t = 20)]
    pub iterations: usize,
    /// Key all workers contend for
    #[arg(long, default_value = "contended")]
    pub key: String,
    /// Lock TTL in milliseconds
    #[arg(long = "ttl-ms", default_value_t = 500)]
    pub ttl_ms: u64,
    /// Time spent inside the critical section in milliseconds
    #[arg(long = "hold-ms", default_value_t = 5)]
    pub hold_ms: u64,
    /// Keep the lock alive with background renewal while holding it
    #[arg(long)]
    pub renew: bool,
    /// Retry attempts per acquisition, overriding the configured policy
    #[arg(long = "max-attempts")]
    pub max_attempts: Option<u32>,
}

impl Default for ContendArgs {
    fn default() -> Self {
        Self {
            workers: 8,
            iterations: 20,
            key: "contended".to_string(),
            ttl_ms: 500,
            hold_ms: 5,
            renew: false,
            max_attempts: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    gave_up: AtomicU64,
    overlaps: AtomicU64,
    lost: AtomicU64,
}

/// Outcome of a contention run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContendReport {
    /// Critical sections entered
    pub acquired: u64,
    /// Acquisitions abandoned after exhausting retries
    pub gave_up: u64,
    /// Times a worker entered while another was still inside
    pub overlaps: u64,
    /// Locks that lapsed or were taken over while held
    pub lost: u64,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl ContendReport {
    /// Fail if mutual exclusion was violated.
    pub fn check(&self) -> anyhow::Result<()> {
        ensure!(
            self.overlaps == 0,
            "{} overlapping critical sections observed",
            self.overlaps
        );
        Ok(())
    }
}

impl fmt::Display for ContendReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "acquired:    {}", self.acquired)?;
        writeln!(f, "gave up:     {}", self.gave_up)?;
        writeln!(f, "lost:        {}", self.lost)?;
        writeln!(f, "overlaps:    {}", self.overlaps)?;
        if self.interrupted {
            writeln!(f, "interrupted: yes")?;
        }
        write!(f, "elapsed:     {:?}", self.elapsed)
    }
}

/// Run `args.workers` tasks that each enter a critical section guarded by
/// one lock `args.iterations` times, then report what they observed.
///
/// A shutdown signal stops the workers after their current iteration.
pub async fn run_contend(
    manager: Arc<dyn LockManager>,
    args: &ContendArgs,
    policy: RetryPolicy,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<ContendReport> {
    ensure!(args.workers > 0, "at least one worker is required");
    ensure!(args.ttl_ms > 0, "ttl must be positive");

    let policy = match args.max_attempts {
        Some(max_attempts) => RetryPolicy {
            max_attempts,
            ..policy
        },
        None => policy,
    };
    let ttl = Duration::from_millis(args.ttl_ms);
    let hold = Duration::from_millis(args.hold_ms);
    let counters = Arc::new(Counters::default());
    let inside = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));

    info!(
        workers = args.workers,
        iterations = args.iterations,
        key = %args.key,
        ttl_ms = args.ttl_ms,
        renew = args.renew,
        "Starting contention run"
    );
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let worker = Worker {
            id: worker,
            manager: manager.clone(),
            retrying: RetryingLockManager::new(manager.clone(), policy),
            key: args.key.clone(),
            ttl,
            hold,
            renew: args.renew,
            counters: counters.clone(),
            inside: inside.clone(),
            interrupted: interrupted.clone(),
        };
        let iterations = args.iterations;
        handles.push(tokio::spawn(async move { worker.run(iterations).await }));
    }

    let interrupt = interrupted.clone();
    let watcher = tokio::spawn(async move {
        if shutdown_rx.recv().await.is_ok() {
            warn!("Stopping workers after their current iteration");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let results = futures::future::join_all(handles).await;
    watcher.abort();
    for result in results {
        result.context("contention worker panicked")??;
    }

    let report = ContendReport {
        acquired: counters.acquired.load(Ordering::SeqCst),
        gave_up: counters.gave_up.load(Ordering::SeqCst),
        overlaps: counters.overlaps.load(Ordering::SeqCst),
        lost: counters.lost.load(Ordering::SeqCst),
        interrupted: interrupted.load(Ordering::SeqCst),
        elapsed: started.elapsed(),
    };
    info!(
        acquired = report.acquired,
        gave_up = report.gave_up,
        overlaps = report.overlaps,
        lost = report.lost,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Contention run finished"
    );
    Ok(report)
}

struct Worker {
    id: usize,
    manager: Arc<dyn LockManager>,
    retrying: RetryingLockManager<Arc<dyn LockManager>>,
    key: String,
    ttl: Duration,
    hold: Duration,
    renew: bool,
    counters: Arc<Counters>,
    inside: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, iterations: usize) -> anyhow::Result<()> {
        for _ in 0..iterations {
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }

            let token = match self.retrying.acquire(&self.key, self.ttl, None).await {
                Ok(token) => token,
                Err(e) if e.is_contention() => {
                    debug!(worker = self.id, "Gave up waiting for lock");
                    self.counters.gave_up.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);

            let renewal = self
                .renew
                .then(|| AutoRenewal::start(self.manager.clone(), self.key.as_str(), token.as_str(), self.ttl));

            if self.inside.swap(true, Ordering::SeqCst) {
                warn!(worker = self.id, key = %self.key, "Entered critical section while it was occupied");
                self.counters.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(self.hold).await;
            self.inside.store(false, Ordering::SeqCst);

            if let Some(renewal) = renewal
                && let Err(e) = renewal.finish().await
            {
                debug!(worker = self.id, error = %e, "Renewal ended early");
                self.counters.lost.fetch_add(1, Ordering::SeqCst);
            }

            match self.manager.release(&self.key, &token).await {
                Ok(()) => {}
                Err(e) if e.is_ownership_violation() => {
                    debug!(worker = self.id, "Lock was taken over before release");
                    self.counters.lost.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
