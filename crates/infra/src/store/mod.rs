//! Product table + append-only event log.
//!
//! One boundary, two backends: an in-memory store for tests and embedding,
//! and a SQLite store for durable deployments. Both commit the product row
//! and its history entry as a single atomic unit.

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryProvenanceStore;
pub use r#trait::{
    EventLogStore, ProductFilter, ProductStore, ProductWrite, ProvenanceStore, StoreError, advance_anchor,
    merge_registry_columns,
};
pub use sqlite::{SqliteProvenanceStore, SqliteStoreOptions};
