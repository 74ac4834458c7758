use std::sync::Arc;

use thiserror::Error;

use provenance_core::{ActorId, EventId, ExpectedVersion, LedgerTokenId, ProductId, TxRef};
use provenance_events::{AnchorStatus, AppendRejected, NewEvent, SupplyChainEvent};
use provenance_products::{Product, ProductStatus};

/// Persistence error.
///
/// These are **infrastructure errors** (ordering, concurrency, availability)
/// as opposed to domain errors (validation, authorization).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency check on the product row failed.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// Event ordering rule violated at append.
    #[error("append rejected: {0}")]
    Rejected(#[from] AppendRejected),

    /// Anchor status regression, txRef overwrite, ledger token overwrite or duplicate row.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout or unavailable backend; safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Anything else (poisoned lock, undecodable row, schema error).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Concurrency(_) | StoreError::Transient(_))
    }
}

/// Product-row half of an atomic registry commit.
#[derive(Debug, Clone)]
pub enum ProductWrite {
    /// Insert a new row; fails with `Conflict` if the id exists.
    Create(Product),
    /// Persist the registry-owned columns (status, custodian, updated_at,
    /// version) when the stored version equals `expected_version`.
    Update {
        product: Product,
        expected_version: ExpectedVersion,
    },
}

impl ProductWrite {
    pub fn product(&self) -> &Product {
        match self {
            ProductWrite::Create(product) => product,
            ProductWrite::Update { product, .. } => product,
        }
    }

    pub fn expected_version(&self) -> ExpectedVersion {
        match self {
            ProductWrite::Create(_) => ExpectedVersion::NoAggregate,
            ProductWrite::Update { expected_version, .. } => *expected_version,
        }
    }

    /// Compare the stored row version (`None` when absent) with what this
    /// write expects.
    pub fn check_version(&self, actual: Option<u64>) -> Result<(), StoreError> {
        let expected = self.expected_version();
        if expected.matches(actual) {
            return Ok(());
        }
        let id = self.product().id_typed();
        Err(match (expected, actual) {
            (ExpectedVersion::NoAggregate, _) => StoreError::Conflict(format!("product {id} already exists")),
            (_, None) => StoreError::NotFound(format!("product {id}")),
            (_, Some(found)) => StoreError::Concurrency(format!("expected {expected:?}, found {found}")),
        })
    }
}

/// Filter for listing products. Empty filter lists everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilter {
    pub custodian: Option<ActorId>,
    pub manufacturer: Option<ActorId>,
    pub status: Option<ProductStatus>,
}

impl ProductFilter {
    pub fn custodian(mut self, actor: impl Into<ActorId>) -> Self {
        self.custodian = Some(actor.into());
        self
    }

    pub fn manufacturer(mut self, actor: impl Into<ActorId>) -> Self {
        self.manufacturer = Some(actor.into());
        self
    }

    pub fn status(mut self, status: ProductStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, product: &Product) -> bool {
        self.custodian
            .as_ref()
            .is_none_or(|c| product.current_custodian_id() == c)
            && self
                .manufacturer
                .as_ref()
                .is_none_or(|m| product.manufacturer_id() == m)
            && self.status.is_none_or(|s| product.status() == s)
    }
}

/// Authoritative product table.
pub trait ProductStore: Send + Sync {
    fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError>;

    /// Products matching `filter`, oldest first.
    fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError>;

    /// Write-once fold-back of the ledger token minted by the creation anchor.
    ///
    /// `Ok(true)` when set, `Ok(false)` when the same token was already
    /// recorded, `Conflict` for a different token.
    fn set_ledger_token(&self, product_id: ProductId, token: &LedgerTokenId) -> Result<bool, StoreError>;
}

/// Append-only supply-chain history.
///
/// Implementations must:
/// - reject a first event that is not `Manufacture` and any later `Manufacture`
/// - assign strictly increasing per-product timestamps (microsecond resolution)
/// - never change core fields after append
pub trait EventLogStore: Send + Sync {
    fn append(&self, event: NewEvent) -> Result<SupplyChainEvent, StoreError>;

    /// The only mutation path for stored events; anchor status never regresses.
    fn update_anchor_status(
        &self,
        event_id: EventId,
        status: AnchorStatus,
        tx_ref: Option<&TxRef>,
    ) -> Result<SupplyChainEvent, StoreError>;

    /// Full history of a product, newest first.
    fn query(&self, product_id: ProductId) -> Result<Vec<SupplyChainEvent>, StoreError>;

    fn get_event(&self, event_id: EventId) -> Result<Option<SupplyChainEvent>, StoreError>;
}

/// Product table and event log sharing one atomic unit of work.
pub trait ProvenanceStore: ProductStore + EventLogStore {
    /// Persist the product write and append `event` together: both or neither.
    fn commit(&self, write: ProductWrite, event: NewEvent) -> Result<SupplyChainEvent, StoreError>;
}

/// Apply an anchor-status transition to a stored event.
///
/// Returns `Ok(false)` for an idempotent re-application, `Ok(true)` when the
/// event changed. Shared by every backend so they agree on monotonicity.
pub fn advance_anchor(
    event: &mut SupplyChainEvent,
    status: AnchorStatus,
    tx_ref: Option<&TxRef>,
) -> Result<bool, StoreError> {
    if !event.ledger_anchor_status.can_advance_to(status) {
        return Err(StoreError::Conflict(format!(
            "anchor status of event {} cannot move from {} to {}",
            event.id, event.ledger_anchor_status, status
        )));
    }

    let tx_changed = match (&event.ledger_tx_ref, tx_ref) {
        (Some(existing), Some(new)) if existing != new => {
            return Err(StoreError::Conflict(format!(
                "event {} already carries tx ref {existing}",
                event.id
            )));
        }
        (None, Some(_)) => true,
        _ => false,
    };

    if event.ledger_anchor_status == status && !tx_changed {
        return Ok(false);
    }

    event.ledger_anchor_status = status;
    if tx_changed {
        event.ledger_tx_ref = tx_ref.cloned();
    }
    Ok(true)
}

/// Copy the registry-owned columns of `updated` onto `stored`.
///
/// Everything else (notably the ledger token) keeps its stored value, so a
/// registry update can never undo a concurrent token fold-back.
pub fn merge_registry_columns(stored: &Product, updated: &Product) -> Product {
    let mut record = stored.to_record();
    let changes = updated.to_record();
    record.status = changes.status;
    record.current_custodian_id = changes.current_custodian_id;
    record.updated_at = changes.updated_at;
    record.version = changes.version;
    Product::rehydrate(record)
}

impl<S> ProductStore for Arc<S>
where
    S: ProductStore + ?Sized,
{
    fn get_product(&self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        (**self).get_product(product_id)
    }

    fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        (**self).list_products(filter)
    }

    fn set_ledger_token(&self, product_id: ProductId, token: &LedgerTokenId) -> Result<bool, StoreError> {
        (**self).set_ledger_token(product_id, token)
    }
}

impl<S> EventLogStore for Arc<S>
where
    S: EventLogStore + ?Sized,
{
    fn append(&self, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        (**self).append(event)
    }

    fn update_anchor_status(
        &self,
        event_id: EventId,
        status: AnchorStatus,
        tx_ref: Option<&TxRef>,
    ) -> Result<SupplyChainEvent, StoreError> {
        (**self).update_anchor_status(event_id, status, tx_ref)
    }

    fn query(&self, product_id: ProductId) -> Result<Vec<SupplyChainEvent>, StoreError> {
        (**self).query(product_id)
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<SupplyChainEvent>, StoreError> {
        (**self).get_event(event_id)
    }
}

impl<S> ProvenanceStore for Arc<S>
where
    S: ProvenanceStore + ?Sized,
{
    fn commit(&self, write: ProductWrite, event: NewEvent) -> Result<SupplyChainEvent, StoreError> {
        (**self).commit(write, event)
    }
}
