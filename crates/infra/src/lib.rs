//! Infrastructure layer: stores, ledger transport, registry service,
//! synchronization coordinator, config and runtime wiring.

pub mod config;
pub mod content;
pub mod hooks;
pub mod ledger;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod sync;

pub use config::{ConfigError, ProvenanceConfig, StoreBackend};
pub use content::{ContentStore, ContentStoreError, InMemoryContentStore};
pub use hooks::{BusNotifier, HookError, NotificationSink, RecordingNotifier};
pub use registry::{
    NewProduct, ProductRegistry, ProvenanceView, RegistryError, TransferIntent, VerificationState,
};
pub use retry::{RetryPolicy, Retryable};
pub use runtime::ProvenanceRuntime;
