//! Downstream collaborators notified once an event is durably appended.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use provenance_events::{EventBus, ProvenanceNotice};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Receives a notice for every committed event, in per-product append order.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: &ProvenanceNotice) -> Result<(), HookError>;
}

impl<N> NotificationSink for Arc<N>
where
    N: NotificationSink + ?Sized,
{
    fn notify(&self, notice: &ProvenanceNotice) -> Result<(), HookError> {
        (**self).notify(notice)
    }
}

/// Forwards notices to a bus, where notification services subscribe.
#[derive(Debug)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> NotificationSink for BusNotifier<B>
where
    B: EventBus<ProvenanceNotice>,
{
    fn notify(&self, notice: &ProvenanceNotice) -> Result<(), HookError> {
        self.bus
            .publish(notice.clone())
            .map_err(|err| HookError::Delivery(format!("{err:?}")))
    }
}

/// Keeps every notice it receives. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<ProvenanceNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<ProvenanceNotice> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notice: &ProvenanceNotice) -> Result<(), HookError> {
        self.received
            .lock()
            .map_err(|_| HookError::Delivery("recorder poisoned".to_string()))?
            .push(notice.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use provenance_core::{ActorId, EventId, ProductId};
    use provenance_events::{InMemoryEventBus, NoticeActors, SupplyChainEventType};

    fn notice() -> ProvenanceNotice {
        ProvenanceNotice {
            product_id: ProductId::new(),
            event_id: EventId::new(),
            sequence: 1,
            event_type: SupplyChainEventType::Manufacture,
            actor_ids: NoticeActors {
                recorded_by: ActorId::new("U1"),
                from: None,
                to: Some(ActorId::new("U1")),
            },
            location: "Plant".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn bus_notifier_publishes_to_subscribers() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let notifier = BusNotifier::new(bus);

        let n = notice();
        notifier.notify(&n).unwrap();
        assert_eq!(sub.try_recv().unwrap(), n);
    }

    #[test]
    fn recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        let (a, b) = (notice(), notice());
        notifier.notify(&a).unwrap();
        notifier.notify(&b).unwrap();
        assert_eq!(notifier.received(), vec![a, b]);
    }
}
