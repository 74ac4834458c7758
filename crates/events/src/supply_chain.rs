//! Supply-chain history model: the facts the event log stores.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use provenance_core::{ActorId, DomainError, EventId, Metadata, ProductId, TxRef};

/// Kind of fact recorded about a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupplyChainEventType {
    Manufacture,
    Transfer,
    QualityCheck,
    Delivery,
    Recall,
}

impl SupplyChainEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manufacture => "Manufacture",
            Self::Transfer => "Transfer",
            Self::QualityCheck => "QualityCheck",
            Self::Delivery => "Delivery",
            Self::Recall => "Recall",
        }
    }
}

impl core::fmt::Display for SupplyChainEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SupplyChainEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Manufacture" => Ok(Self::Manufacture),
            "Transfer" => Ok(Self::Transfer),
            "QualityCheck" => Ok(Self::QualityCheck),
            "Delivery" => Ok(Self::Delivery),
            "Recall" => Ok(Self::Recall),
            other => Err(DomainError::validation(format!("unknown event type '{other}'"))),
        }
    }
}

/// Progress of an event's anchor into the external ledger.
///
/// Monotonic: `NotSubmitted < Pending < {Confirmed, Failed}`. `Confirmed` and
/// `Failed` are both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnchorStatus {
    NotSubmitted,
    Pending,
    Confirmed,
    Failed,
}

impl AnchorStatus {
    fn rank(self) -> u8 {
        match self {
            Self::NotSubmitted => 0,
            Self::Pending => 1,
            Self::Confirmed | Self::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Re-applying the current status is allowed (idempotent update).
    pub fn can_advance_to(self, next: AnchorStatus) -> bool {
        self == next || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSubmitted => "NotSubmitted",
            Self::Pending => "Pending",
            Self::Confirmed => "Confirmed",
            Self::Failed => "Failed",
        }
    }
}

impl core::fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for AnchorStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotSubmitted" => Ok(Self::NotSubmitted),
            "Pending" => Ok(Self::Pending),
            "Confirmed" => Ok(Self::Confirmed),
            "Failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown anchor status '{other}'"))),
        }
    }
}

/// An event ready to be appended to a product's history (not yet sequenced).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: EventId,
    pub product_id: ProductId,
    pub event_type: SupplyChainEventType,
    /// Actor that recorded the event.
    pub actor_id: ActorId,
    pub from_actor_id: Option<ActorId>,
    pub to_actor_id: Option<ActorId>,
    pub location: String,
    /// Assigned by the log store when absent.
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn new(
        product_id: ProductId,
        event_type: SupplyChainEventType,
        actor_id: ActorId,
        location: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            product_id,
            event_type,
            actor_id,
            from_actor_id: None,
            to_actor_id: None,
            location: location.into(),
            timestamp: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_parties(mut self, from: Option<ActorId>, to: Option<ActorId>) -> Self {
        self.from_actor_id = from;
        self.to_actor_id = to;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A stored supply-chain event.
///
/// Core fields are write-once; only `ledger_anchor_status` and `ledger_tx_ref`
/// change after append, and only forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyChainEvent {
    pub id: EventId,
    pub product_id: ProductId,
    /// 1-based position in the product's stream.
    pub sequence: u64,
    pub event_type: SupplyChainEventType,
    pub actor_id: ActorId,
    pub from_actor_id: Option<ActorId>,
    pub to_actor_id: Option<ActorId>,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub ledger_anchor_status: AnchorStatus,
    pub ledger_tx_ref: Option<TxRef>,
}

/// Tail of a product's stream, as seen by a store about to append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTail {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppendRejected {
    #[error("first event of product {0} must be Manufacture")]
    FirstEventNotManufacture(ProductId),

    #[error("product {0} already has a Manufacture event")]
    DuplicateManufacture(ProductId),

    #[error("timestamp {supplied} is not after the last event at {last}")]
    NonMonotonicTimestamp {
        supplied: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Pick the timestamp for the next event of a stream.
///
/// Microsecond resolution; strictly greater than `last` even when the clock
/// has not moved (or moved backwards).
pub fn next_timestamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = now.trunc_subsecs(6);
    match last {
        Some(last) if candidate <= last => last + chrono::Duration::microseconds(1),
        _ => candidate,
    }
}

/// Sequence a new event against the current stream tail.
///
/// Shared by every log backend so they agree on ordering rules.
pub fn sequence_event(
    tail: Option<StreamTail>,
    event: NewEvent,
    now: DateTime<Utc>,
) -> Result<SupplyChainEvent, AppendRejected> {
    match (tail, event.event_type) {
        (None, SupplyChainEventType::Manufacture) => {}
        (None, _) => return Err(AppendRejected::FirstEventNotManufacture(event.product_id)),
        (Some(_), SupplyChainEventType::Manufacture) => {
            return Err(AppendRejected::DuplicateManufacture(event.product_id));
        }
        (Some(_), _) => {}
    }

    let last = tail.map(|t| t.timestamp);
    let timestamp = match event.timestamp {
        Some(supplied) => {
            let supplied = supplied.trunc_subsecs(6);
            if let Some(last) = last {
                if supplied <= last {
                    return Err(AppendRejected::NonMonotonicTimestamp { supplied, last });
                }
            }
            supplied
        }
        None => next_timestamp(last, now),
    };

    Ok(SupplyChainEvent {
        id: event.id,
        product_id: event.product_id,
        sequence: tail.map(|t| t.sequence).unwrap_or(0) + 1,
        event_type: event.event_type,
        actor_id: event.actor_id,
        from_actor_id: event.from_actor_id,
        to_actor_id: event.to_actor_id,
        location: event.location,
        timestamp,
        metadata: event.metadata,
        ledger_anchor_status: AnchorStatus::NotSubmitted,
        ledger_tx_ref: None,
    })
}

impl SupplyChainEvent {
    pub fn tail(&self) -> StreamTail {
        StreamTail {
            sequence: self.sequence,
            timestamp: self.timestamp,
        }
    }
}
