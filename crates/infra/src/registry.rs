//! Product Registry service: the synchronous command path.
//!
//! ```text
//! intent
//!   ↓
//! 1. Lock the product stripe (same-product writes serialize)
//!   ↓
//! 2. Load the product row
//!   ↓
//! 3. Handle the command (pure: validation, authorization, state machine)
//!   ↓
//! 4. Commit product row + history entry atomically (optimistic version check)
//!   ↓
//! 5. Publish the committed event on the commit bus, still under the lock
//! ```
//!
//! Retryable store failures (timeouts, version races) re-run steps 2-4 a
//! bounded number of times. Before re-running, the event of the failed
//! attempt is looked up: a commit that landed despite the error is kept,
//! never repeated. The ledger is never on this path.

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use provenance_auth::Actor;
use provenance_core::{ActorId, Aggregate, AggregateRoot, DomainError, EventId, ExpectedVersion, Metadata, ProductId};
use provenance_events::{AnchorStatus, AppendRejected, EventBus, SupplyChainEvent, SupplyChainEventType};
use provenance_products::{
    AddEvent, CreateProduct, Product, ProductCommand, ProductStatus, TransferProduct, UpdateStatus,
};

use crate::content::{ContentStore, ContentStoreError};
use crate::retry::RetryPolicy;
use crate::store::{ProductFilter, ProductWrite, ProvenanceStore, StoreError};

/// Registry operation failure.
///
/// The first four are deterministic and never retried. `TransientStore` is
/// what remains after bounded retries of a retryable store failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store temporarily unavailable: {0}")]
    TransientStore(String),
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::TransientStore(_))
    }
}

impl From<DomainError> for RegistryError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => RegistryError::Validation(msg),
            DomainError::InvariantViolation(msg) => RegistryError::Validation(msg),
            DomainError::InvalidId(msg) => RegistryError::Validation(msg),
            DomainError::NotFound => RegistryError::NotFound("product not found".to_string()),
            DomainError::Conflict(msg) => RegistryError::Conflict(msg),
            DomainError::Unauthorized(msg) => RegistryError::Unauthorized(msg),
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Rejected(AppendRejected::DuplicateManufacture(id)) => {
                RegistryError::Conflict(format!("product {id} already has a Manufacture event"))
            }
            StoreError::Rejected(rejected) => RegistryError::Validation(rejected.to_string()),
            StoreError::Conflict(msg) => RegistryError::Conflict(msg),
            StoreError::NotFound(msg) => RegistryError::NotFound(msg),
            StoreError::Concurrency(msg) | StoreError::Transient(msg) | StoreError::Backend(msg) => {
                RegistryError::TransientStore(msg)
            }
        }
    }
}

impl From<ContentStoreError> for RegistryError {
    fn from(value: ContentStoreError) -> Self {
        match value {
            ContentStoreError::Unavailable(msg) => RegistryError::TransientStore(format!("content store: {msg}")),
            ContentStoreError::Serialization(msg) => RegistryError::Validation(msg),
        }
    }
}

/// Input of `create_product`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub sku: String,
    pub batch_id: String,
    pub category: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewProduct {
    pub fn new(
        name: impl Into<String>,
        sku: impl Into<String>,
        batch_id: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            sku: sku.into(),
            batch_id: batch_id.into(),
            category: category.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A custody hand-off request. Never persisted as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub product_id: ProductId,
    pub to_actor_id: Option<ActorId>,
    pub location: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransferIntent {
    pub fn new(product_id: ProductId, to_actor_id: impl Into<ActorId>, location: impl Into<String>) -> Self {
        Self {
            product_id,
            to_actor_id: Some(to_actor_id.into()),
            location: location.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// User-facing summary of ledger anchoring across a product's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// Every event is confirmed on the ledger.
    Verified,
    /// Some events are not anchored yet.
    Pending,
    /// At least one anchor failed; the history is not ledger-verifiable.
    Unavailable,
}

impl VerificationState {
    pub fn of(history: &[SupplyChainEvent]) -> Self {
        if history
            .iter()
            .any(|e| e.ledger_anchor_status == AnchorStatus::Failed)
        {
            VerificationState::Unavailable
        } else if !history.is_empty()
            && history
                .iter()
                .all(|e| e.ledger_anchor_status == AnchorStatus::Confirmed)
        {
            VerificationState::Verified
        } else {
            VerificationState::Pending
        }
    }
}

/// Product, newest-first history and ledger verification in one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceView {
    pub product: Product,
    pub history: Vec<SupplyChainEvent>,
    pub verification: VerificationState,
}

const DEFAULT_STRIPES: usize = 64;

/// Striped per-product mutex: same product serializes, different products
/// rarely contend.
#[derive(Debug)]
struct ProductLocks {
    stripes: Vec<Mutex<()>>,
}

impl ProductLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, product_id: ProductId) -> Result<MutexGuard<'_, ()>, RegistryError> {
        let idx = (product_id.as_uuid().as_u128() % self.stripes.len() as u128) as usize;
        self.stripes[idx]
            .lock()
            .map_err(|_| RegistryError::TransientStore("product lock poisoned".to_string()))
    }
}

enum AttemptError {
    Rejected(RegistryError),
    Store(StoreError),
}

impl From<DomainError> for AttemptError {
    fn from(value: DomainError) -> Self {
        AttemptError::Rejected(value.into())
    }
}

impl From<StoreError> for AttemptError {
    fn from(value: StoreError) -> Self {
        AttemptError::Store(value)
    }
}

/// Authoritative product registry.
///
/// - `S`: product table + event log (one atomic unit per commit)
/// - `C`: content store for product metadata documents
/// - `B`: commit bus; receives every committed event in per-product append order
#[derive(Debug)]
pub struct ProductRegistry<S, C, B> {
    store: S,
    content: C,
    bus: B,
    locks: ProductLocks,
    retry: RetryPolicy,
}

impl<S, C, B> ProductRegistry<S, C, B>
where
    S: ProvenanceStore,
    C: ContentStore,
    B: EventBus<SupplyChainEvent>,
{
    pub fn new(store: S, content: C, bus: B) -> Self {
        Self {
            store,
            content,
            bus,
            locks: ProductLocks::new(DEFAULT_STRIPES),
            retry: RetryPolicy::exponential(3, Duration::from_millis(10), Duration::from_millis(200)),
        }
    }

    /// Retry policy for retryable store failures.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a new product (status `Manufactured`, custodian = caller).
    #[instrument(skip(self, draft), fields(actor = %actor, sku = %draft.sku))]
    pub fn create_product(&self, actor: &Actor, draft: NewProduct) -> Result<Product, RegistryError> {
        let product_id = ProductId::new();
        let mut command = CreateProduct {
            actor: actor.clone(),
            product_id,
            name: draft.name,
            sku: draft.sku,
            batch_id: draft.batch_id,
            category: draft.category,
            metadata: draft.metadata,
            content_metadata_ref: None,
            occurred_at: Utc::now(),
        };

        // Reject bad input before anything reaches the content store.
        Product::empty(product_id).handle(&ProductCommand::CreateProduct(command.clone()))?;

        if !command.metadata.is_empty() {
            command.content_metadata_ref = Some(self.content.put(&command.metadata)?);
        }

        let (product, event) = self.execute(product_id, ProductCommand::CreateProduct(command))?;
        info!(product_id = %product_id, event_id = %event.id, "product created");
        Ok(product)
    }

    /// Hand custody to `intent.to_actor_id`; status becomes `InTransit`.
    #[instrument(skip(self, intent), fields(actor = %actor, product_id = %intent.product_id))]
    pub fn transfer_product(&self, actor: &Actor, intent: TransferIntent) -> Result<(), RegistryError> {
        let product_id = intent.product_id;
        let (product, event) = self.execute(
            product_id,
            ProductCommand::TransferProduct(TransferProduct {
                actor: actor.clone(),
                product_id,
                to_actor_id: intent.to_actor_id,
                location: intent.location,
                metadata: intent.metadata,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(event_id = %event.id, custodian = %product.current_custodian_id(), "product transferred");
        Ok(())
    }

    #[instrument(skip(self, location, metadata), fields(actor = %actor, product_id = %product_id, status = %new_status))]
    pub fn update_status(
        &self,
        actor: &Actor,
        product_id: ProductId,
        new_status: ProductStatus,
        location: impl Into<String>,
        metadata: Metadata,
    ) -> Result<(), RegistryError> {
        let (_, event) = self.execute(
            product_id,
            ProductCommand::UpdateStatus(UpdateStatus {
                actor: actor.clone(),
                product_id,
                new_status,
                location: location.into(),
                metadata,
                occurred_at: Utc::now(),
            }),
        )?;
        info!(event_id = %event.id, event_type = %event.event_type, "product status updated");
        Ok(())
    }

    /// Record a history-only event; the product itself is untouched.
    #[instrument(skip(self, location, metadata), fields(actor = %actor, product_id = %product_id, event_type = %event_type))]
    pub fn add_event(
        &self,
        actor: &Actor,
        product_id: ProductId,
        event_type: SupplyChainEventType,
        location: impl Into<String>,
        metadata: Metadata,
    ) -> Result<EventId, RegistryError> {
        let (_, event) = self.execute(
            product_id,
            ProductCommand::AddEvent(AddEvent {
                actor: actor.clone(),
                product_id,
                event_type,
                location: location.into(),
                metadata,
                occurred_at: Utc::now(),
            }),
        )?;
        debug!(event_id = %event.id, "event recorded");
        Ok(event.id)
    }

    pub fn get_product(&self, product_id: ProductId) -> Result<Product, RegistryError> {
        self.store
            .get_product(product_id)?
            .ok_or_else(|| RegistryError::NotFound(format!("product {product_id}")))
    }

    /// Full history, newest first.
    pub fn get_history(&self, product_id: ProductId) -> Result<Vec<SupplyChainEvent>, RegistryError> {
        let history = self.store.query(product_id)?;
        if history.is_empty() {
            return Err(RegistryError::NotFound(format!("product {product_id}")));
        }
        Ok(history)
    }

    /// Products matching `filter`, oldest first.
    pub fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, RegistryError> {
        Ok(self.store.list_products(filter)?)
    }

    pub fn get_provenance(&self, product_id: ProductId) -> Result<ProvenanceView, RegistryError> {
        let product = self.get_product(product_id)?;
        let history = self.store.query(product_id)?;
        let verification = VerificationState::of(&history);
        Ok(ProvenanceView {
            product,
            history,
            verification,
        })
    }

    fn execute(
        &self,
        product_id: ProductId,
        command: ProductCommand,
    ) -> Result<(Product, SupplyChainEvent), RegistryError> {
        let _guard = self.locks.lock(product_id)?;

        // Event of the last attempt whose store call failed without a verdict.
        let mut in_doubt: Option<EventId> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match in_doubt.take() {
                Some(event_id) => match self.landed(product_id, event_id) {
                    Ok(Some(done)) => Ok(done),
                    Ok(None) => self.try_execute(product_id, &command, &mut in_doubt),
                    Err(err) => {
                        in_doubt = Some(event_id);
                        Err(AttemptError::Store(err))
                    }
                },
                None => self.try_execute(product_id, &command, &mut in_doubt),
            };

            match outcome {
                Ok((product, event)) => {
                    // Publishing under the product lock keeps per-product bus order
                    // equal to append order.
                    if let Err(err) = self.bus.publish(event.clone()) {
                        error!(event_id = %event.id, error = ?err, "committed event could not be published");
                    }
                    return Ok((product, event));
                }
                Err(AttemptError::Store(err)) => match self.retry.retry_after(attempt, &err) {
                    Some(delay) => {
                        warn!(product_id = %product_id, attempt, ?delay, error = %err, "retrying registry write");
                        thread::sleep(delay);
                    }
                    None => return Err(err.into()),
                },
                Err(AttemptError::Rejected(err)) => return Err(err),
            }
        }
    }

    /// Read back an attempt whose commit reported a failure; a timeout can
    /// fire after the transaction was already durable.
    fn landed(
        &self,
        product_id: ProductId,
        event_id: EventId,
    ) -> Result<Option<(Product, SupplyChainEvent)>, StoreError> {
        let Some(event) = self.store.get_event(event_id)? else {
            return Ok(None);
        };
        let product = self.store.get_product(product_id)?.ok_or_else(|| {
            StoreError::Backend(format!("event {event_id} is stored without product {product_id}"))
        })?;
        warn!(product_id = %product_id, event_id = %event_id, "failed commit was persisted; keeping it");
        Ok(Some((product, event)))
    }

    fn try_execute(
        &self,
        product_id: ProductId,
        command: &ProductCommand,
        in_doubt: &mut Option<EventId>,
    ) -> Result<(Product, SupplyChainEvent), AttemptError> {
        let current = self
            .store
            .get_product(product_id)?
            .unwrap_or_else(|| Product::empty(product_id));

        let change = current.handle(command)?;
        let new_event = change.to_new_event();
        *in_doubt = Some(new_event.id);

        if !change.mutates_product() {
            let event = self.store.append(new_event)?;
            return Ok((current, event));
        }

        let mut next = current.clone();
        next.apply(&change);

        let write = if current.is_created() {
            ProductWrite::Update {
                product: next.clone(),
                expected_version: ExpectedVersion::Exact(current.version()),
            }
        } else {
            ProductWrite::Create(next.clone())
        };

        let event = self.store.commit(write, new_event)?;
        Ok((next, event))
    }
}
