//! Supply-chain events and their distribution.
//!
//! - `supply_chain`: the history model (events, anchor status, ordering rules)
//! - `bus` / `in_memory_bus`: fan-out of committed facts
//! - `notice`: the payload downstream collaborators receive
//! - `stream`: replayable append-only stream for analytics

pub mod bus;
pub mod in_memory_bus;
pub mod notice;
pub mod stream;
pub mod supply_chain;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notice::{NoticeActors, ProvenanceNotice};
pub use stream::{AnalyticsStream, AppendOnlyStream, StreamReader};
pub use supply_chain::{
    AnchorStatus, AppendRejected, NewEvent, StreamTail, SupplyChainEvent, SupplyChainEventType,
    next_timestamp, sequence_event,
};
