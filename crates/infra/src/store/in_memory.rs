use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::debug;

use provenance_core::{AggregateRoot, EventId, LedgerTokenId, ProductId, TxRef};
use provenance_events::{AnchorStatus, NewEvent, SupplyChainEvent, sequence_event};
use provenance_products::Product;

use super::r#trait::{
    EventLogStore, ProductFilter, ProductStore, ProductWrite, ProvenanceStore, StoreError, advance_anchor,
    merge_registry_columns,
};

#[derive(Debug, Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    /// Ascending append order per product.
    streams: HashMap<ProductId, Vec<SupplyChainEvent>>,
    event_index: HashMap<EventId, (ProductId, usize)>,
}

impl Tables {
    fn sequence(&self, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        let tail = self
            .streams
            .get(&event.product_id)
            .and_then(|s| s.last())
            .map(SupplyChainEvent::tail);
        if self.event_index.contains_key(&event.id) {
            return Err(StoreError::Conflict(format!("event {} already exists", event.id)));
        }
        Ok(sequence_event(tail, event, Utc::now())?)
    }

    fn push(&mut self, event: SupplyChainEvent) {
        let stream = self.streams.entry(event.product_id).or_default();
        self.event_index.insert(event.id, (event.product_id, stream.len()));
        stream.push(event);
    }

    /// Validate a product write without applying it.
    fn prepare(&self, write: ProductWrite) -> Result<Product, StoreError> {
        let stored = self.products.get(&write.product().id_typed());
        write.check_version(stored.map(|p| p.version()))?;
        match (write, stored) {
            (ProductWrite::Update { product, .. }, Some(stored)) => Ok(merge_registry_columns(stored, &product)),
            (write, _) => Ok(write.product().clone()),
        }
    }
}

/// In-memory product table + event log under one lock.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryProvenanceStore {
    tables: RwLock<Tables>,
}

impl InMemoryProvenanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all products.
    pub fn event_count(&self) -> usize {
        self.tables.read().map(|t| t.event_index.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

impl ProductStore for InMemoryProvenanceStore {
    fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.read()?.products.get(&product_id).cloned())
    }

    fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let tables = self.read()?;
        let mut products: Vec<Product> = tables
            .products
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        products.sort_by_key(|p| (p.created_at(), p.id_typed()));
        Ok(products)
    }

    fn set_ledger_token(&self, product_id: ProductId, token: &LedgerTokenId) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let product = tables
            .products
            .get_mut(&product_id)
            .ok_or_else(|| StoreError::NotFound(format!("product {product_id}")))?;
        product
            .attach_ledger_token(token.clone())
            .map_err(|e| StoreError::Conflict(e.to_string()))
    }
}

impl EventLogStore for InMemoryProvenanceStore {
    fn append(&self, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        let mut tables = self.write()?;
        let stored = tables.sequence(event)?;
        tables.push(stored.clone());
        debug!(event_id = %stored.id, product_id = %stored.product_id, sequence = stored.sequence, "event appended");
        Ok(stored)
    }

    fn update_anchor_status(
        &self,
        event_id: EventId,
        status: AnchorStatus,
        tx_ref: Option<&TxRef>,
    ) -> Result<SupplyChainEvent, StoreError> {
        let mut tables = self.write()?;
        let (product_id, idx) = *tables
            .event_index
            .get(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {event_id}")))?;

        let event = tables
            .streams
            .get_mut(&product_id)
            .and_then(|s| s.get_mut(idx))
            .ok_or_else(|| StoreError::Backend(format!("event index out of sync for {event_id}")))?;

        advance_anchor(event, status, tx_ref)?;
        Ok(event.clone())
    }

    fn query(&self, product_id: ProductId) -> Result<Vec<SupplyChainEvent>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .streams
            .get(&product_id)
            .map(|s| s.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<SupplyChainEvent>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .event_index
            .get(&event_id)
            .and_then(|(product_id, idx)| tables.streams.get(product_id)?.get(*idx))
            .cloned())
    }
}

impl ProvenanceStore for InMemoryProvenanceStore {
    fn commit(&self, write: ProductWrite, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        if write.product().id_typed() != event.product_id {
            return Err(StoreError::Backend("product write and event target different products".to_string()));
        }

        let mut tables = self.write()?;

        // Validate both halves before touching either table.
        let product = tables.prepare(write)?;
        let stored = tables.sequence(event)?;

        tables.products.insert(product.id_typed(), product);
        tables.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use provenance_auth::{Actor, Role};
    use provenance_core::{ActorId, Aggregate, ExpectedVersion, Metadata};
    use provenance_events::SupplyChainEventType;
    use provenance_products::{CreateProduct, ProductCommand, ProductStatus};

    fn new_product() -> (Product, NewEvent) {
        let product_id = ProductId::new();
        let mut product = Product::empty(product_id);
        let change = product
            .handle(&ProductCommand::CreateProduct(CreateProduct {
                actor: Actor::new("U1", Role::Manufacturer),
                product_id,
                name: "Widget".into(),
                sku: "W-1".into(),
                batch_id: "B-1".into(),
                category: "tools".into(),
                metadata: Metadata::new(),
                content_metadata_ref: None,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        product.apply(&change);
        (product, change.to_new_event())
    }

    fn note(product_id: ProductId, event_type: SupplyChainEventType) -> NewEvent {
        NewEvent::new(product_id, event_type, ActorId::new("U1"), "Lab")
    }

    #[test]
    fn commit_writes_product_and_first_event_together() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();

        let stored = store.commit(ProductWrite::Create(product.clone()), event).unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(stored.ledger_anchor_status, AnchorStatus::NotSubmitted);
        assert_eq!(store.get_product(product.id_typed()).unwrap(), Some(product));
    }

    #[test]
    fn rejected_event_leaves_product_table_untouched() {
        let store = InMemoryProvenanceStore::new();
        let (product, _) = new_product();

        let err = store
            .commit(
                ProductWrite::Create(product.clone()),
                note(product.id_typed(), SupplyChainEventType::Transfer),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.get_product(product.id_typed()).unwrap(), None);
        assert_eq!(store.event_count(), 0);
    }

    #[test]
    fn stale_version_is_a_concurrency_error() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        store.commit(ProductWrite::Create(product.clone()), event).unwrap();

        let err = store
            .commit(
                ProductWrite::Update {
                    product: product.clone(),
                    expected_version: ExpectedVersion::Exact(7),
                },
                note(product.id_typed(), SupplyChainEventType::QualityCheck),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
        assert!(err.is_retryable());
        assert_eq!(store.query(product.id_typed()).unwrap().len(), 1);
    }

    #[test]
    fn create_over_existing_row_conflicts_and_update_of_missing_row_is_not_found() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        store.commit(ProductWrite::Create(product.clone()), event.clone()).unwrap();

        let err = store.commit(ProductWrite::Create(product.clone()), event).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(!err.is_retryable());

        let (other, _) = new_product();
        let err = store
            .commit(
                ProductWrite::Update {
                    product: other.clone(),
                    expected_version: ExpectedVersion::Exact(1),
                },
                note(other.id_typed(), SupplyChainEventType::QualityCheck),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.event_count(), 1);
    }

    #[test]
    fn update_never_touches_ledger_token() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        store.commit(ProductWrite::Create(product.clone()), event).unwrap();

        assert!(store.set_ledger_token(product.id_typed(), &LedgerTokenId::new("7")).unwrap());

        let mut record = product.to_record();
        record.status = ProductStatus::Delivered;
        record.version = 2;
        store
            .commit(
                ProductWrite::Update {
                    product: Product::rehydrate(record),
                    expected_version: ExpectedVersion::Exact(1),
                },
                note(product.id_typed(), SupplyChainEventType::Delivery),
            )
            .unwrap();

        let stored = store.get_product(product.id_typed()).unwrap().unwrap();
        assert_eq!(stored.status(), ProductStatus::Delivered);
        assert_eq!(stored.ledger_token_id(), Some(&LedgerTokenId::new("7")));
    }

    #[test]
    fn history_is_newest_first_with_strictly_increasing_timestamps() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        store.commit(ProductWrite::Create(product.clone()), event).unwrap();
        for _ in 0..5 {
            store.append(note(product.id_typed(), SupplyChainEventType::QualityCheck)).unwrap();
        }

        let history = store.query(product.id_typed()).unwrap();
        assert_eq!(history.len(), 6);
        assert!(history.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
        assert_eq!(history.last().unwrap().event_type, SupplyChainEventType::Manufacture);
    }

    #[test]
    fn caller_timestamp_must_be_after_the_tail() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        let first = store.commit(ProductWrite::Create(product.clone()), event).unwrap();

        let err = store
            .append(note(product.id_typed(), SupplyChainEventType::QualityCheck).at(first.timestamp))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let later = first.timestamp + Duration::seconds(1);
        let stored = store
            .append(note(product.id_typed(), SupplyChainEventType::QualityCheck).at(later))
            .unwrap();
        assert_eq!(stored.timestamp, later);
    }

    #[test]
    fn anchor_status_never_regresses() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        let stored = store.commit(ProductWrite::Create(product), event).unwrap();
        let tx = TxRef::new("0xabc");

        store.update_anchor_status(stored.id, AnchorStatus::Pending, Some(&tx)).unwrap();
        store.update_anchor_status(stored.id, AnchorStatus::Confirmed, None).unwrap();

        // Idempotent re-application.
        let again = store.update_anchor_status(stored.id, AnchorStatus::Confirmed, Some(&tx)).unwrap();
        assert_eq!(again.ledger_anchor_status, AnchorStatus::Confirmed);
        assert_eq!(again.ledger_tx_ref, Some(tx));

        for regress in [AnchorStatus::Pending, AnchorStatus::NotSubmitted, AnchorStatus::Failed] {
            let err = store.update_anchor_status(stored.id, regress, None).unwrap_err();
            assert!(matches!(err, StoreError::Conflict(_)), "{regress}");
        }
    }

    #[test]
    fn tx_ref_is_write_once() {
        let store = InMemoryProvenanceStore::new();
        let (product, event) = new_product();
        let stored = store.commit(ProductWrite::Create(product), event).unwrap();

        store
            .update_anchor_status(stored.id, AnchorStatus::Pending, Some(&TxRef::new("a")))
            .unwrap();
        let err = store
            .update_anchor_status(stored.id, AnchorStatus::Pending, Some(&TxRef::new("b")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn list_filters_and_orders_by_creation() {
        let store = InMemoryProvenanceStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (product, event) = new_product();
            ids.push(product.id_typed());
            store.commit(ProductWrite::Create(product), event).unwrap();
        }

        let all = store.list_products(&ProductFilter::default()).unwrap();
        assert_eq!(all.iter().map(|p| p.id_typed()).collect::<Vec<_>>(), ids);

        let none = store.list_products(&ProductFilter::default().custodian("nobody")).unwrap();
        assert!(none.is_empty());

        let made = store
            .list_products(&ProductFilter::default().manufacturer("U1").status(ProductStatus::Manufactured))
            .unwrap();
        assert_eq!(made.len(), 3);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = AnchorStatus> {
            prop_oneof![
                Just(AnchorStatus::NotSubmitted),
                Just(AnchorStatus::Pending),
                Just(AnchorStatus::Confirmed),
                Just(AnchorStatus::Failed),
            ]
        }

        proptest! {
            /// Whatever sequence of updates arrives, once Confirmed an event stays Confirmed.
            #[test]
            fn confirmed_is_sticky(updates in proptest::collection::vec(any_status(), 1..20)) {
                let store = InMemoryProvenanceStore::new();
                let (product, event) = new_product();
                let stored = store.commit(ProductWrite::Create(product), event).unwrap();

                let mut confirmed = false;
                for status in updates {
                    let _ = store.update_anchor_status(stored.id, status, None);
                    let current = store.get_event(stored.id).unwrap().unwrap().ledger_anchor_status;
                    if confirmed {
                        prop_assert_eq!(current, AnchorStatus::Confirmed);
                    }
                    confirmed |= current == AnchorStatus::Confirmed;
                }
            }
        }
    }
}
