//! Synchronization coordinator: wiring, shared state and the control handle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use provenance_events::{AnalyticsStream, EventBus, InMemoryEventBus, Subscription, SupplyChainEvent};

use super::anchor::AnchorWorker;
use super::fanout::FanOut;
use super::signal::ReconciliationSignal;
use crate::hooks::NotificationSink;
use crate::ledger::LedgerAnchorClient;
use crate::retry::RetryPolicy;
use crate::store::ProvenanceStore;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to spawn coordinator thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Thread name prefix, also used in logs.
    pub name: String,
    /// Budget for getting a submission accepted (and for waiting on a token).
    pub submit_retry: RetryPolicy,
    /// Budget for polling a submitted transaction to a final outcome.
    pub confirm_retry: RetryPolicy,
    /// Longest either thread blocks before re-checking for shutdown.
    pub poll_interval: Duration,
    /// Re-check interval for a task held behind an in-flight prerequisite.
    pub prerequisite_wait: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "provenance-sync".to_string(),
            submit_retry: RetryPolicy::exponential(5, Duration::from_millis(500), Duration::from_secs(30)),
            confirm_retry: RetryPolicy::exponential(20, Duration::from_millis(500), Duration::from_secs(30)),
            poll_interval: Duration::from_millis(100),
            prerequisite_wait: Duration::from_millis(50),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_submit_retry(mut self, policy: RetryPolicy) -> Self {
        self.submit_retry = policy;
        self
    }

    pub fn with_confirm_retry(mut self, policy: RetryPolicy) -> Self {
        self.confirm_retry = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_prerequisite_wait(mut self, wait: Duration) -> Self {
        self.prerequisite_wait = wait;
        self
    }
}

/// Coordinator runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CoordinatorStats {
    pub events_received: u64,
    pub notifications_sent: u64,
    pub notification_failures: u64,
    /// Submissions accepted by the ledger.
    pub submitted: u64,
    /// Failed submit attempts, retried or not.
    pub submit_errors: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub tokens_folded: u64,
    pub signals: u64,
}

/// State shared between the two coordinator threads and the handle.
#[derive(Debug, Default)]
pub(super) struct Shared {
    stats: Mutex<CoordinatorStats>,
    backlog: Mutex<Vec<ReconciliationSignal>>,
    signal_bus: InMemoryEventBus<ReconciliationSignal>,
    /// Anchor tasks admitted or in flight but not yet settled.
    pending: AtomicUsize,
    /// Bumped each time the fan-out thread finds the commit bus empty.
    idle_ticks: AtomicU64,
}

impl Shared {
    pub(super) fn record(&self, update: impl FnOnce(&mut CoordinatorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    pub(super) fn raise(&self, signal: ReconciliationSignal) {
        warn!(
            event_id = %signal.event_id,
            product_id = %signal.product_id,
            kind = %signal.kind,
            reason = %signal.reason,
            "reconciliation needed"
        );
        self.record(|s| s.signals += 1);
        if let Ok(mut backlog) = self.backlog.lock() {
            backlog.push(signal.clone());
        }
        if let Err(err) = self.signal_bus.publish(signal) {
            warn!(error = ?err, "failed to publish reconciliation signal");
        }
    }

    pub(super) fn task_admitted(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn task_settled(&self) {
        let settled = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if settled.is_err() {
            warn!("anchor task settled with no pending tasks");
        }
    }

    pub(super) fn fan_out_idle(&self) {
        self.idle_ticks.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct WorkerThread {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Handle to control a running coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
    fan_out: WorkerThread,
    anchor: WorkerThread,
    shared: Arc<Shared>,
}

impl CoordinatorHandle {
    /// Stop both threads. Tasks still queued are abandoned; their events keep
    /// whatever anchor status they reached.
    pub fn shutdown(self) {
        // Fan-out first so nothing new reaches the anchor queue.
        self.fan_out.stop();
        self.anchor.stop();
        info!("synchronization coordinator stopped");
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.shared.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Every reconciliation signal raised so far, oldest first.
    pub fn signals(&self) -> Vec<ReconciliationSignal> {
        self.shared.backlog.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Live feed of reconciliation signals raised from now on.
    pub fn subscribe_signals(&self) -> Subscription<ReconciliationSignal> {
        self.shared.signal_bus.subscribe()
    }

    /// Anchor tasks not yet settled.
    pub fn pending_tasks(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Wait until every event published before this call has been through the
    /// hooks and its anchor task has settled. Returns `false` on timeout.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let start = self.shared.idle_ticks.load(Ordering::SeqCst);

        loop {
            let caught_up = self.shared.idle_ticks.load(Ordering::SeqCst) > start;
            if caught_up && self.pending_tasks() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

/// Keeps the ledger and the downstream collaborators in step with the
/// registry, entirely off the request path.
///
/// - fan-out thread: commit bus → notification sink → analytics stream → anchor queue
/// - anchor thread: submit, poll, fold back tokens, raise reconciliation signals
pub struct SyncCoordinator<S, L, N> {
    store: S,
    ledger: L,
    notifier: N,
    analytics: AnalyticsStream,
    config: CoordinatorConfig,
}

impl<S, L, N> SyncCoordinator<S, L, N>
where
    S: ProvenanceStore + 'static,
    L: LedgerAnchorClient + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(store: S, ledger: L, notifier: N, analytics: AnalyticsStream) -> Self {
        Self {
            store,
            ledger,
            notifier,
            analytics,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to `bus` and start both threads.
    ///
    /// Only events published after this call are seen.
    pub fn spawn<B>(self, bus: &B) -> Result<CoordinatorHandle, CoordinatorError>
    where
        B: EventBus<SupplyChainEvent>,
    {
        let subscription = bus.subscribe();
        let shared = Arc::new(Shared::default());
        let (task_tx, task_rx) = mpsc::channel::<SupplyChainEvent>();

        let (anchor_shutdown, anchor_shutdown_rx) = mpsc::channel::<()>();
        let worker = AnchorWorker::new(self.store, self.ledger, self.config.clone(), Arc::clone(&shared));
        let anchor_join = thread::Builder::new()
            .name(format!("{}-anchor", self.config.name))
            .spawn(move || worker.run(task_rx, anchor_shutdown_rx))?;
        let anchor = WorkerThread {
            shutdown: anchor_shutdown,
            join: Some(anchor_join),
        };

        let (fan_out_shutdown, fan_out_shutdown_rx) = mpsc::channel::<()>();
        let fan_out = FanOut::new(
            self.notifier,
            self.analytics,
            task_tx,
            self.config.poll_interval,
            Arc::clone(&shared),
        );
        let fan_out_join = match thread::Builder::new()
            .name(format!("{}-fanout", self.config.name))
            .spawn(move || fan_out.run(subscription, fan_out_shutdown_rx))
        {
            Ok(join) => join,
            Err(err) => {
                anchor.stop();
                return Err(err.into());
            }
        };

        info!(name = %self.config.name, "synchronization coordinator started");

        Ok(CoordinatorHandle {
            fan_out: WorkerThread {
                shutdown: fan_out_shutdown,
                join: Some(fan_out_join),
            },
            anchor,
            shared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settling_more_tasks_than_admitted_keeps_the_count_at_zero() {
        let shared = Shared::default();
        shared.task_admitted();
        shared.task_admitted();
        shared.task_settled();
        assert_eq!(shared.pending.load(Ordering::SeqCst), 1);

        shared.task_settled();
        shared.task_settled();
        assert_eq!(shared.pending.load(Ordering::SeqCst), 0);

        shared.task_admitted();
        assert_eq!(shared.pending.load(Ordering::SeqCst), 1);
    }
}
