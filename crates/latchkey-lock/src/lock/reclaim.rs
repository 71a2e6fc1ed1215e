//! Background reclamation of expired lock entries
//!
//! Purely a memory bound: acquire and release check expiry themselves, so a
//! sweep that never runs only costs memory, never correctness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::store::LockStore;

const ENTRIES_GAUGE: &str = "latchkey_lock_entries";
const RECLAIMED_COUNTER: &str = "latchkey_lock_reclaimed_total";

/// Register descriptions for the metrics published by the sweep.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        ENTRIES_GAUGE,
        "Lock entries held by the local store, including expired ones not yet swept"
    );
    metrics::describe_counter!(
        RECLAIMED_COUNTER,
        "Total number of expired lock entries removed by the sweep"
    );
}

/// Handle to the periodic sweep task
pub(crate) struct Reclaimer {
    store: Arc<LockStore>,
    stopped: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    /// Spawn the sweep on the current Tokio runtime.
    ///
    /// A zero `period` spawns nothing; the handle then only reports stopped.
    pub(crate) fn spawn(store: Arc<LockStore>, period: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stopped = Arc::new(AtomicBool::new(period.is_zero()));

        let handle = (!period.is_zero()).then(|| {
            tokio::spawn(Self::run(
                store.clone(),
                stopped.clone(),
                stop_rx,
                period,
            ))
        });

        Self {
            store,
            stopped,
            stop_tx,
            handle: Mutex::new(handle),
        }
    }

    async fn run(
        store: Arc<LockStore>,
        stopped: Arc<AtomicBool>,
        mut stop_rx: watch::Receiver<bool>,
        period: Duration,
    ) {
        debug!(period_ms = period.as_millis() as u64, "Lock reclamation task started");

        // First sweep one full period after start
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(removed) = store.reclaim(Instant::now(), &stopped) else {
                        break;
                    };
                    metrics::gauge!(ENTRIES_GAUGE).set(store.len() as f64);
                    if removed > 0 {
                        metrics::counter!(RECLAIMED_COUNTER).increment(removed as u64);
                        debug!(removed, "Reclaimed expired locks");
                    }
                }
                // Fires on stop, and on sender drop
                _ = stop_rx.changed() => break,
            }
        }

        debug!("Lock reclamation task stopped");
    }

    /// Signal the task to exit. Idempotent and safe from any thread.
    ///
    /// Returns once no sweep can mutate the store any more.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_tx.send_replace(true);
        // A sweep that began before the flag flipped finishes inside this barrier
        self.store.barrier();
        info!("Lock reclamation stopped");
    }

    /// Stop and wait for the task to exit.
    pub(crate) async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            exited_cleanly(handle.await);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log a sweep task that ended by panic or cancellation.
fn exited_cleanly(result: std::result::Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Lock reclamation task did not exit cleanly");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    const PERIOD: Duration = Duration::from_millis(10);

    fn store_with(entries: &[(&str, Duration)]) -> Arc<LockStore> {
        let store = Arc::new(LockStore::new());
        let now = Instant::now();
        for (key, ttl) in entries {
            store
                .acquire(key, *ttl, Some("holder"), now, || unreachable!())
                .unwrap();
        }
        store
    }

    fn metric_value(rendered: &str, name: &str) -> Option<f64> {
        rendered.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != name {
                return None;
            }
            parts.next()?.parse().ok()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_entries() {
        let store = store_with(&[("short", Duration::from_millis(5)), ("long", Duration::from_secs(10))]);
        let reclaimer = Reclaimer::spawn(store.clone(), PERIOD);

        tokio::time::sleep(PERIOD + Duration::from_millis(5)).await;
        assert!(!store.contains("short"));
        assert!(store.contains("long"));

        reclaimer.shutdown().await;
        assert!(reclaimer.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_sweep() {
        let store = store_with(&[("job", Duration::from_millis(5))]);
        let reclaimer = Reclaimer::spawn(store.clone(), PERIOD);
        drop(reclaimer);

        tokio::time::sleep(PERIOD * 5).await;
        // Expired but never collected
        assert!(store.contains("job"));
        assert_eq!(store.stats(Instant::now()).reclaimed_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_spawns_nothing() {
        let store = store_with(&[("job", Duration::from_millis(5))]);
        let reclaimer = Reclaimer::spawn(store.clone(), Duration::ZERO);
        assert!(reclaimer.is_stopped());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.contains("job"));
        reclaimer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_publishes_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        // The current-thread test runtime polls the sweep on this thread
        let _guard = metrics::set_default_local_recorder(&recorder);
        describe_metrics();

        let store = store_with(&[("short", Duration::from_millis(5)), ("long", Duration::from_secs(10))]);
        let reclaimer = Reclaimer::spawn(store.clone(), PERIOD);
        tokio::time::sleep(PERIOD + Duration::from_millis(5)).await;
        reclaimer.shutdown().await;

        let rendered = handle.render();
        assert_eq!(metric_value(&rendered, ENTRIES_GAUGE), Some(1.0));
        assert_eq!(metric_value(&rendered, RECLAIMED_COUNTER), Some(1.0));
    }

    #[tokio::test]
    async fn test_panicked_task_is_reported() {
        assert!(exited_cleanly(tokio::spawn(async {}).await));

        let fail = true;
        let panicked = tokio::spawn(async move {
            if fail {
                panic!("sweep failed");
            }
        })
        .await;
        assert!(!exited_cleanly(panicked));
    }
}
