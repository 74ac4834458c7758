//! Process wiring: builds every collaborator from [`ProvenanceConfig`] and
//! starts the synchronization coordinator.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use provenance_events::{AnalyticsStream, EventBus, InMemoryEventBus, ProvenanceNotice, Subscription, SupplyChainEvent};

use crate::config::{ProvenanceConfig, StoreBackend};
use crate::content::{ContentStore, InMemoryContentStore};
use crate::hooks::BusNotifier;
use crate::ledger::{JsonRpcLedgerClient, JsonRpcLedgerConfig, LedgerAnchorClient, SimulatedLedger};
use crate::registry::ProductRegistry;
use crate::store::{InMemoryProvenanceStore, ProvenanceStore, SqliteProvenanceStore, SqliteStoreOptions};
use crate::sync::{CoordinatorConfig, CoordinatorHandle, SyncCoordinator};

pub type SharedStore = Arc<dyn ProvenanceStore>;
pub type SharedLedger = Arc<dyn LedgerAnchorClient>;
pub type SharedContent = Arc<dyn ContentStore>;
pub type CommitBus = Arc<InMemoryEventBus<SupplyChainEvent>>;
pub type Registry = ProductRegistry<SharedStore, SharedContent, CommitBus>;

/// A running provenance service: registry in front, coordinator behind.
pub struct ProvenanceRuntime {
    registry: Registry,
    store: SharedStore,
    coordinator: CoordinatorHandle,
    notices: Arc<InMemoryEventBus<ProvenanceNotice>>,
    analytics: AnalyticsStream,
}

impl ProvenanceRuntime {
    /// Start with the ledger named by the configuration (simulated when no URL is set).
    pub fn start(config: &ProvenanceConfig) -> anyhow::Result<Self> {
        let ledger: SharedLedger = match &config.ledger_url {
            Some(url) => Arc::new(
                JsonRpcLedgerClient::new(JsonRpcLedgerConfig::new(url.clone()).with_timeout(config.ledger_timeout()))
                    .context("failed to build ledger client")?,
            ) as SharedLedger,
            None => Arc::new(SimulatedLedger::default()) as SharedLedger,
        };
        Self::start_with_ledger(config, ledger)
    }

    pub fn start_with_ledger(config: &ProvenanceConfig, ledger: SharedLedger) -> anyhow::Result<Self> {
        let coordinator_config = CoordinatorConfig::default()
            .with_submit_retry(config.submit_retry())
            .with_confirm_retry(config.confirm_retry());
        Self::start_with(config, ledger, coordinator_config)
    }

    pub fn start_with(
        config: &ProvenanceConfig,
        ledger: SharedLedger,
        coordinator_config: CoordinatorConfig,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid provenance configuration")?;

        let store: SharedStore = match config.store {
            StoreBackend::Memory => Arc::new(InMemoryProvenanceStore::new()) as SharedStore,
            StoreBackend::Sqlite => Arc::new(
                SqliteProvenanceStore::connect(
                    SqliteStoreOptions::new(config.sqlite_url.clone()).with_timeout(config.store_timeout()),
                )
                .with_context(|| format!("failed to open sqlite store at {}", config.sqlite_url))?,
            ) as SharedStore,
        };

        let commits: CommitBus = Arc::new(InMemoryEventBus::new());
        let notices = Arc::new(InMemoryEventBus::new());
        let analytics = AnalyticsStream::new();

        // Subscribe before the registry can commit anything.
        let coordinator = SyncCoordinator::new(
            Arc::clone(&store),
            ledger,
            BusNotifier::new(Arc::clone(&notices)),
            analytics.clone(),
        )
        .with_config(coordinator_config)
        .spawn(&commits)
        .context("failed to start synchronization coordinator")?;

        let content: SharedContent = Arc::new(InMemoryContentStore::new());
        let registry = ProductRegistry::new(Arc::clone(&store), content, commits)
            .with_retry_policy(config.registry_retry());

        info!(store = ?config.store, ledger = config.ledger_url.as_deref().unwrap_or("simulated"), "provenance runtime started");

        Ok(Self {
            registry,
            store,
            coordinator,
            notices,
            analytics,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Notices delivered to the notification collaborator from now on.
    pub fn subscribe_notices(&self) -> Subscription<ProvenanceNotice> {
        self.notices.subscribe()
    }

    pub fn analytics(&self) -> &AnalyticsStream {
        &self.analytics
    }

    pub fn shutdown(self) {
        self.coordinator.shutdown();
        info!("provenance runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use provenance_auth::{Actor, Role};
    use provenance_core::LedgerTokenId;
    use provenance_events::AnchorStatus;

    use super::*;
    use crate::registry::{NewProduct, VerificationState};
    use crate::store::ProductStore;

    fn fast(config: ProvenanceConfig) -> ProvenanceConfig {
        ProvenanceConfig {
            anchor_base_delay_ms: 2,
            anchor_max_delay_ms: 20,
            ..config
        }
    }

    fn create_and_anchor(runtime: &ProvenanceRuntime) {
        let notices = runtime.subscribe_notices();
        let product = runtime
            .registry()
            .create_product(&Actor::new("U1", Role::Manufacturer), NewProduct::new("Widget", "W-1", "B-1", "tools"))
            .unwrap();
        let id = product.id_typed();

        assert!(runtime.coordinator().drain(Duration::from_secs(10)));

        let view = runtime.registry().get_provenance(id).unwrap();
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.history[0].ledger_anchor_status, AnchorStatus::Confirmed);
        assert_eq!(view.verification, VerificationState::Verified);
        assert_eq!(view.product.ledger_token_id(), Some(&LedgerTokenId::new("1")));
        assert_eq!(runtime.store().get_product(id).unwrap(), Some(view.product.clone()));

        let notice = notices.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(notice.product_id, id);
    }

    #[test]
    fn memory_runtime_anchors_a_new_product() {
        let runtime = ProvenanceRuntime::start(&fast(ProvenanceConfig::default())).unwrap();
        create_and_anchor(&runtime);
        runtime.shutdown();
    }

    #[test]
    fn sqlite_runtime_anchors_a_new_product() {
        let config = fast(ProvenanceConfig {
            store: StoreBackend::Sqlite,
            sqlite_url: "sqlite::memory:".to_string(),
            ..ProvenanceConfig::default()
        });
        let runtime = ProvenanceRuntime::start(&config).unwrap();
        create_and_anchor(&runtime);
        runtime.shutdown();
    }

    #[test]
    fn invalid_configuration_fails_to_start() {
        let config = ProvenanceConfig {
            store_retries: 0,
            ..ProvenanceConfig::default()
        };
        let err = ProvenanceRuntime::start(&config).err().unwrap();
        assert!(format!("{err:#}").contains("PROVENANCE_STORE_RETRIES"));
    }
}
