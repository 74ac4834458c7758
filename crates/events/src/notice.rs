use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use provenance_core::{ActorId, EventId, ProductId};

use crate::supply_chain::{SupplyChainEvent, SupplyChainEventType};

/// Actors involved in a finalized event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeActors {
    pub recorded_by: ActorId,
    pub from: Option<ActorId>,
    pub to: Option<ActorId>,
}

/// Payload handed to the notification and analytics collaborators once an
/// event has been durably appended.
///
/// Deliberately carries no ledger state: downstream consumers never wait on
/// anchoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceNotice {
    pub product_id: ProductId,
    pub event_id: EventId,
    pub sequence: u64,
    pub event_type: SupplyChainEventType,
    pub actor_ids: NoticeActors,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&SupplyChainEvent> for ProvenanceNotice {
    fn from(event: &SupplyChainEvent) -> Self {
        Self {
            product_id: event.product_id,
            event_id: event.id,
            sequence: event.sequence,
            event_type: event.event_type,
            actor_ids: NoticeActors {
                recorded_by: event.actor_id.clone(),
                from: event.from_actor_id.clone(),
                to: event.to_actor_id.clone(),
            },
            location: event.location.clone(),
            timestamp: event.timestamp,
        }
    }
}
