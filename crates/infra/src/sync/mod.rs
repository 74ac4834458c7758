//! Synchronization coordinator.
//!
//! Everything that happens after a registry commit: notification and
//! analytics hooks, ledger anchoring, token fold-back and reconciliation
//! signals. Nothing here can fail or delay a registry operation.

mod anchor;
pub mod coordinator;
mod fanout;
pub mod signal;
pub mod task;

pub use coordinator::{CoordinatorConfig, CoordinatorError, CoordinatorHandle, CoordinatorStats, SyncCoordinator};
pub use signal::{ReconciliationKind, ReconciliationSignal};
pub use task::{AnchorPhase, AnchorTask, TaskQueue};
