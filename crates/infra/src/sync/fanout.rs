use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use tracing::{debug, warn};

use provenance_events::{AnalyticsStream, ProvenanceNotice, Subscription, SupplyChainEvent};

use super::coordinator::Shared;
use crate::hooks::NotificationSink;

/// Commit-bus consumer: hooks first, then hand-off to the anchor queue.
///
/// One thread, so per-product hook order is bus order, which is append order.
pub(super) struct FanOut<N> {
    notifier: N,
    analytics: AnalyticsStream,
    anchor_queue: mpsc::Sender<SupplyChainEvent>,
    tick: Duration,
    shared: Arc<Shared>,
}

impl<N: NotificationSink> FanOut<N> {
    pub(super) fn new(
        notifier: N,
        analytics: AnalyticsStream,
        anchor_queue: mpsc::Sender<SupplyChainEvent>,
        tick: Duration,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            notifier,
            analytics,
            anchor_queue,
            tick,
            shared,
        }
    }

    pub(super) fn run(self, subscription: Subscription<SupplyChainEvent>, shutdown: mpsc::Receiver<()>) {
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match subscription.recv_timeout(self.tick) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => self.shared.fan_out_idle(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn dispatch(&self, event: SupplyChainEvent) {
        self.shared.record(|s| s.events_received += 1);
        let notice = ProvenanceNotice::from(&event);

        match self.notifier.notify(&notice) {
            Ok(()) => self.shared.record(|s| s.notifications_sent += 1),
            Err(err) => {
                self.shared.record(|s| s.notification_failures += 1);
                warn!(event_id = %event.id, product_id = %event.product_id, error = %err, "notification hook failed");
            }
        }

        let offset = self.analytics.append(notice);
        debug!(event_id = %event.id, offset, "analytics notice appended");

        if event.ledger_anchor_status.is_terminal() {
            return;
        }

        self.shared.task_admitted();
        if self.anchor_queue.send(event).is_err() {
            self.shared.task_settled();
            warn!("anchor worker gone; event left unanchored");
        }
    }
}
