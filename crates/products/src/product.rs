use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use provenance_auth::Actor;
use provenance_core::{
    ActorId, Aggregate, AggregateRoot, DomainError, DomainResult, LedgerTokenId, Metadata,
    ProductId,
};
use provenance_events::{NewEvent, SupplyChainEventType};

use crate::capability::{Operation, authorize};
use crate::status::ProductStatus;

/// Metadata keys written on status-update events.
pub const STATUS_FROM_KEY: &str = "status_from";
pub const STATUS_TO_KEY: &str = "status_to";
/// Optional metadata key supplying the Manufacture event's location.
pub const LOCATION_KEY: &str = "location";

/// Persisted shape of a product row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub name: String,
    pub sku: String,
    pub batch_id: String,
    pub category: String,
    pub manufacturer_id: ActorId,
    pub current_custodian_id: ActorId,
    pub status: ProductStatus,
    pub ledger_token_id: Option<LedgerTokenId>,
    pub content_metadata_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Aggregate root: the authoritative, mutable record of a tracked product.
///
/// Only the registry changes `status` and `current_custodian_id` (through
/// `handle` + `apply`). `ledger_token_id` is folded back once by the
/// synchronization side and is write-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    sku: String,
    batch_id: String,
    category: String,
    manufacturer_id: ActorId,
    current_custodian_id: ActorId,
    status: ProductStatus,
    ledger_token_id: Option<LedgerTokenId>,
    content_metadata_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    #[serde(skip)]
    created: bool,
}

impl Product {
    /// Create an empty, not-yet-created aggregate instance (target of `CreateProduct`).
    pub fn empty(id: ProductId) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id,
            name: String::new(),
            sku: String::new(),
            batch_id: String::new(),
            category: String::new(),
            manufacturer_id: ActorId::new(""),
            current_custodian_id: ActorId::new(""),
            status: ProductStatus::Manufactured,
            ledger_token_id: None,
            content_metadata_ref: None,
            created_at: epoch,
            updated_at: epoch,
            version: 0,
            created: false,
        }
    }

    /// Rebuild from a stored row.
    pub fn rehydrate(record: ProductRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            sku: record.sku,
            batch_id: record.batch_id,
            category: record.category,
            manufacturer_id: record.manufacturer_id,
            current_custodian_id: record.current_custodian_id,
            status: record.status,
            ledger_token_id: record.ledger_token_id,
            content_metadata_ref: record.content_metadata_ref,
            created_at: record.created_at,
            updated_at: record.updated_at,
            version: record.version,
            created: true,
        }
    }

    pub fn to_record(&self) -> ProductRecord {
        ProductRecord {
            id: self.id,
            name: self.name.clone(),
            sku: self.sku.clone(),
            batch_id: self.batch_id.clone(),
            category: self.category.clone(),
            manufacturer_id: self.manufacturer_id.clone(),
            current_custodian_id: self.current_custodian_id.clone(),
            status: self.status,
            ledger_token_id: self.ledger_token_id.clone(),
            content_metadata_ref: self.content_metadata_ref.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn manufacturer_id(&self) -> &ActorId {
        &self.manufacturer_id
    }

    pub fn current_custodian_id(&self) -> &ActorId {
        &self.current_custodian_id
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn ledger_token_id(&self) -> Option<&LedgerTokenId> {
        self.ledger_token_id.as_ref()
    }

    pub fn content_metadata_ref(&self) -> Option<&str> {
        self.content_metadata_ref.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Record the ledger token minted by the creation anchor.
    ///
    /// Returns `Ok(true)` when the token was set, `Ok(false)` when the same
    /// token was already present, and `Conflict` for a different token.
    pub fn attach_ledger_token(&mut self, token: LedgerTokenId) -> DomainResult<bool> {
        match &self.ledger_token_id {
            None => {
                self.ledger_token_id = Some(token);
                Ok(true)
            }
            Some(existing) if *existing == token => Ok(false),
            Some(existing) => Err(DomainError::conflict(format!(
                "product {} already carries ledger token {existing}",
                self.id
            ))),
        }
    }
}

impl AggregateRoot for Product {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub actor: Actor,
    pub product_id: ProductId,
    pub name: String,
    pub sku: String,
    pub batch_id: String,
    pub category: String,
    pub metadata: Metadata,
    pub content_metadata_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransferProduct (the transfer intent; never persisted as such).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProduct {
    pub actor: Actor,
    pub product_id: ProductId,
    pub to_actor_id: Option<ActorId>,
    pub location: String,
    pub metadata: Metadata,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub actor: Actor,
    pub product_id: ProductId,
    pub new_status: ProductStatus,
    pub location: String,
    pub metadata: Metadata,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddEvent (history annotation only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddEvent {
    pub actor: Actor,
    pub product_id: ProductId,
    pub event_type: SupplyChainEventType,
    pub location: String,
    pub metadata: Metadata,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductCommand {
    CreateProduct(CreateProduct),
    TransferProduct(TransferProduct),
    UpdateStatus(UpdateStatus),
    AddEvent(AddEvent),
}

impl ProductCommand {
    pub fn product_id(&self) -> ProductId {
        match self {
            ProductCommand::CreateProduct(c) => c.product_id,
            ProductCommand::TransferProduct(c) => c.product_id,
            ProductCommand::UpdateStatus(c) => c.product_id,
            ProductCommand::AddEvent(c) => c.product_id,
        }
    }
}

/// Decided change: what the registry records for an accepted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductChange {
    Created {
        record: ProductRecord,
        location: String,
        metadata: Metadata,
    },
    Transferred {
        product_id: ProductId,
        by: ActorId,
        from: ActorId,
        to: ActorId,
        location: String,
        metadata: Metadata,
        occurred_at: DateTime<Utc>,
    },
    StatusChanged {
        product_id: ProductId,
        by: ActorId,
        from: ProductStatus,
        to: ProductStatus,
        location: String,
        metadata: Metadata,
        occurred_at: DateTime<Utc>,
    },
    /// History-only entry; leaves the product untouched.
    Annotated {
        product_id: ProductId,
        by: ActorId,
        event_type: SupplyChainEventType,
        location: String,
        metadata: Metadata,
    },
}

impl ProductChange {
    /// Whether applying this change mutates the product row.
    pub fn mutates_product(&self) -> bool {
        !matches!(self, ProductChange::Annotated { .. })
    }

    /// History entry to append for this change.
    pub fn to_new_event(&self) -> NewEvent {
        match self {
            ProductChange::Created {
                record,
                location,
                metadata,
            } => NewEvent::new(
                record.id,
                SupplyChainEventType::Manufacture,
                record.manufacturer_id.clone(),
                location.clone(),
            )
            .with_parties(None, Some(record.manufacturer_id.clone()))
            .with_metadata(metadata.clone()),
            ProductChange::Transferred {
                product_id,
                by,
                from,
                to,
                location,
                metadata,
                ..
            } => NewEvent::new(*product_id, SupplyChainEventType::Transfer, by.clone(), location.clone())
                .with_parties(Some(from.clone()), Some(to.clone()))
                .with_metadata(metadata.clone()),
            ProductChange::StatusChanged {
                product_id,
                by,
                from,
                to,
                location,
                metadata,
                ..
            } => NewEvent::new(*product_id, to.event_type(), by.clone(), location.clone())
                .with_parties(Some(by.clone()), None)
                .with_metadata(
                    metadata
                        .clone()
                        .with(STATUS_FROM_KEY, from.as_str())
                        .with(STATUS_TO_KEY, to.as_str()),
                ),
            ProductChange::Annotated {
                product_id,
                by,
                event_type,
                location,
                metadata,
            } => NewEvent::new(*product_id, *event_type, by.clone(), location.clone())
                .with_parties(Some(by.clone()), None)
                .with_metadata(metadata.clone()),
        }
    }
}

impl Aggregate for Product {
    type Command = ProductCommand;
    type Event = ProductChange;
    type Error = DomainError;

    fn apply(&mut self, change: &Self::Event) {
        match change {
            ProductChange::Created { record, .. } => {
                *self = Product::rehydrate(record.clone());
                return;
            }
            ProductChange::Transferred { to, occurred_at, .. } => {
                self.current_custodian_id = to.clone();
                self.status = ProductStatus::InTransit;
                self.updated_at = *occurred_at;
            }
            ProductChange::StatusChanged { to, occurred_at, .. } => {
                self.status = *to;
                self.updated_at = *occurred_at;
            }
            ProductChange::Annotated { .. } => return,
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Self::Event, Self::Error> {
        match command {
            ProductCommand::CreateProduct(cmd) => self.handle_create(cmd),
            ProductCommand::TransferProduct(cmd) => self.handle_transfer(cmd),
            ProductCommand::UpdateStatus(cmd) => self.handle_update_status(cmd),
            ProductCommand::AddEvent(cmd) => self.handle_add_event(cmd),
        }
    }
}

fn require_field(value: &str, field: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    Ok(())
}

impl Product {
    fn ensure_product_id(&self, product_id: ProductId) -> DomainResult<()> {
        if self.id != product_id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        Ok(())
    }

    fn ensure_exists(&self, product_id: ProductId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_product_id(product_id)
    }

    fn handle_create(&self, cmd: &CreateProduct) -> DomainResult<ProductChange> {
        require_field(&cmd.name, "name")?;
        require_field(&cmd.sku, "sku")?;
        require_field(&cmd.batch_id, "batch_id")?;
        require_field(&cmd.category, "category")?;
        if cmd.actor.actor_id.is_blank() {
            return Err(DomainError::validation("actor id is required"));
        }

        authorize(&cmd.actor, Operation::CreateProduct, None)?;

        if self.created {
            return Err(DomainError::conflict("product already exists"));
        }
        self.ensure_product_id(cmd.product_id)?;

        let location = cmd.metadata.get_str(LOCATION_KEY).unwrap_or_default().to_string();

        Ok(ProductChange::Created {
            record: ProductRecord {
                id: cmd.product_id,
                name: cmd.name.trim().to_string(),
                sku: cmd.sku.trim().to_string(),
                batch_id: cmd.batch_id.trim().to_string(),
                category: cmd.category.trim().to_string(),
                manufacturer_id: cmd.actor.actor_id.clone(),
                current_custodian_id: cmd.actor.actor_id.clone(),
                status: ProductStatus::Manufactured,
                ledger_token_id: None,
                content_metadata_ref: cmd.content_metadata_ref.clone(),
                created_at: stamp(cmd.occurred_at),
                updated_at: stamp(cmd.occurred_at),
                version: 1,
            },
            location,
            metadata: cmd.metadata.clone(),
        })
    }

    fn handle_transfer(&self, cmd: &TransferProduct) -> DomainResult<ProductChange> {
        self.ensure_exists(cmd.product_id)?;
        authorize(&cmd.actor, Operation::TransferProduct, Some(self))?;

        let to = match &cmd.to_actor_id {
            Some(to) if !to.is_blank() => to.clone(),
            _ => return Err(DomainError::validation("to_actor_id is required")),
        };

        self.status.ensure_can_transition_to(ProductStatus::InTransit)?;

        Ok(ProductChange::Transferred {
            product_id: self.id,
            by: cmd.actor.actor_id.clone(),
            from: self.current_custodian_id.clone(),
            to,
            location: cmd.location.clone(),
            metadata: cmd.metadata.clone(),
            occurred_at: stamp(cmd.occurred_at),
        })
    }

    fn handle_update_status(&self, cmd: &UpdateStatus) -> DomainResult<ProductChange> {
        self.ensure_exists(cmd.product_id)?;

        let operation = if cmd.new_status == ProductStatus::Recalled {
            Operation::RecallProduct
        } else {
            Operation::UpdateStatus
        };
        authorize(&cmd.actor, operation, Some(self))?;

        self.status.ensure_can_transition_to(cmd.new_status)?;

        Ok(ProductChange::StatusChanged {
            product_id: self.id,
            by: cmd.actor.actor_id.clone(),
            from: self.status,
            to: cmd.new_status,
            location: cmd.location.clone(),
            metadata: cmd.metadata.clone(),
            occurred_at: stamp(cmd.occurred_at),
        })
    }

    fn handle_add_event(&self, cmd: &AddEvent) -> DomainResult<ProductChange> {
        self.ensure_exists(cmd.product_id)?;
        authorize(&cmd.actor, Operation::AddEvent, Some(self))?;

        if cmd.event_type == SupplyChainEventType::Manufacture {
            return Err(DomainError::validation(
                "Manufacture is recorded by product creation only",
            ));
        }

        // Recalled products still accept annotations.
        Ok(ProductChange::Annotated {
            product_id: self.id,
            by: cmd.actor.actor_id.clone(),
            event_type: cmd.event_type,
            location: cmd.location.clone(),
            metadata: cmd.metadata.clone(),
        })
    }
}

/// Row timestamps are kept at microsecond precision, the finest every store persists.
fn stamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use provenance_auth::Role;

    fn manufacturer() -> Actor {
        Actor::new("U1", Role::Manufacturer)
    }

    fn create_cmd(actor: Actor, product_id: ProductId) -> CreateProduct {
        CreateProduct {
            actor,
            product_id,
            name: "Widget".to_string(),
            sku: "W-1".to_string(),
            batch_id: "B-1".to_string(),
            category: "tools".to_string(),
            metadata: Metadata::new(),
            content_metadata_ref: None,
            occurred_at: Utc::now(),
        }
    }

    fn created_product() -> Product {
        let product_id = ProductId::new();
        let mut product = Product::empty(product_id);
        let change = product
            .handle(&ProductCommand::CreateProduct(create_cmd(manufacturer(), product_id)))
            .unwrap();
        product.apply(&change);
        product
    }

    fn transfer(product: &Product, actor: Actor, to: &str) -> DomainResult<ProductChange> {
        product.handle(&ProductCommand::TransferProduct(TransferProduct {
            actor,
            product_id: product.id_typed(),
            to_actor_id: Some(ActorId::new(to)),
            location: "Dock A".to_string(),
            metadata: Metadata::new(),
            occurred_at: Utc::now(),
        }))
    }

    fn update_status(product: &Product, actor: Actor, status: ProductStatus) -> DomainResult<ProductChange> {
        product.handle(&ProductCommand::UpdateStatus(UpdateStatus {
            actor,
            product_id: product.id_typed(),
            new_status: status,
            location: "Warehouse".to_string(),
            metadata: Metadata::new(),
            occurred_at: Utc::now(),
        }))
    }

    #[test]
    fn create_sets_manufacturer_as_custodian() {
        let product = created_product();
        assert!(product.is_created());
        assert_eq!(product.status(), ProductStatus::Manufactured);
        assert_eq!(product.current_custodian_id(), &ActorId::new("U1"));
        assert_eq!(product.manufacturer_id(), &ActorId::new("U1"));
        assert_eq!(product.version(), 1);
        assert!(product.ledger_token_id().is_none());
    }

    #[test]
    fn create_emits_a_manufacture_entry() {
        let product_id = ProductId::new();
        let mut cmd = create_cmd(manufacturer(), product_id);
        cmd.metadata = Metadata::new().with(LOCATION_KEY, "Plant 7");
        let change = Product::empty(product_id)
            .handle(&ProductCommand::CreateProduct(cmd))
            .unwrap();

        let event = change.to_new_event();
        assert_eq!(event.event_type, SupplyChainEventType::Manufacture);
        assert_eq!(event.location, "Plant 7");
        assert_eq!(event.to_actor_id, Some(ActorId::new("U1")));
    }

    #[test]
    fn create_rejects_blank_required_fields() {
        let product_id = ProductId::new();
        let mut cmd = create_cmd(manufacturer(), product_id);
        cmd.batch_id = "  ".to_string();

        let err = Product::empty(product_id)
            .handle(&ProductCommand::CreateProduct(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_requires_manufacturer_or_admin() {
        let product_id = ProductId::new();
        let cmd = create_cmd(Actor::new("S1", Role::Seller), product_id);
        let err = Product::empty(product_id)
            .handle(&ProductCommand::CreateProduct(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));

        let cmd = create_cmd(Actor::new("root", Role::Admin), product_id);
        assert!(Product::empty(product_id).handle(&ProductCommand::CreateProduct(cmd)).is_ok());
    }

    #[test]
    fn create_rejects_duplicate_creation() {
        let product = created_product();
        let cmd = create_cmd(manufacturer(), product.id_typed());
        let err = product.handle(&ProductCommand::CreateProduct(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn transfer_moves_custody_and_marks_in_transit() {
        let mut product = created_product();
        let change = transfer(&product, manufacturer(), "U2").unwrap();
        product.apply(&change);

        assert_eq!(product.current_custodian_id(), &ActorId::new("U2"));
        assert_eq!(product.status(), ProductStatus::InTransit);
        assert_eq!(product.version(), 2);

        let event = change.to_new_event();
        assert_eq!(event.event_type, SupplyChainEventType::Transfer);
        assert_eq!(event.from_actor_id, Some(ActorId::new("U1")));
        assert_eq!(event.to_actor_id, Some(ActorId::new("U2")));
    }

    #[test]
    fn transfer_by_non_custodian_is_unauthorized() {
        let product = created_product();
        let err = transfer(&product, Actor::new("U7", Role::Wholesaler), "U2").unwrap_err();
        assert!(matches!(err, DomainError::Unauthorized(_)));

        assert!(transfer(&product, Actor::new("root", Role::Admin), "U2").is_ok());
    }

    #[test]
    fn transfer_requires_destination() {
        let product = created_product();
        let err = product
            .handle(&ProductCommand::TransferProduct(TransferProduct {
                actor: manufacturer(),
                product_id: product.id_typed(),
                to_actor_id: None,
                location: String::new(),
                metadata: Metadata::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn handling_commands_on_missing_product_is_not_found() {
        let product = Product::empty(ProductId::new());
        let err = transfer(&product, manufacturer(), "U2").unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn recalled_product_rejects_transfer_and_status_updates() {
        let mut product = created_product();
        let change = update_status(&product, manufacturer(), ProductStatus::Recalled).unwrap();
        product.apply(&change);
        assert_eq!(product.status(), ProductStatus::Recalled);

        let before = product.clone();
        assert!(matches!(transfer(&product, manufacturer(), "U3"), Err(DomainError::Conflict(_))));
        for status in ProductStatus::ALL {
            assert!(matches!(
                update_status(&product, manufacturer(), status),
                Err(DomainError::Conflict(_))
            ));
        }
        assert_eq!(product, before);
    }

    #[test]
    fn status_update_records_transition_in_metadata() {
        let product = created_product();
        let change = update_status(&product, manufacturer(), ProductStatus::Delivered).unwrap();
        let event = change.to_new_event();
        assert_eq!(event.event_type, SupplyChainEventType::Delivery);
        assert_eq!(event.metadata.get_str(STATUS_FROM_KEY), Some("Manufactured"));
        assert_eq!(event.metadata.get_str(STATUS_TO_KEY), Some("Delivered"));
    }

    #[test]
    fn inspector_may_recall_without_custody_but_not_deliver() {
        let product = created_product();
        let inspector = Actor::new("inspector1", Role::Inspector);
        assert!(update_status(&product, inspector.clone(), ProductStatus::Recalled).is_ok());
        assert!(matches!(
            update_status(&product, inspector, ProductStatus::Delivered),
            Err(DomainError::Unauthorized(_))
        ));
    }

    #[test]
    fn annotations_leave_the_product_untouched_even_when_recalled() {
        let mut product = created_product();
        let change = update_status(&product, manufacturer(), ProductStatus::Recalled).unwrap();
        product.apply(&change);
        let before = product.clone();

        let change = product
            .handle(&ProductCommand::AddEvent(AddEvent {
                actor: Actor::new("inspector1", Role::Inspector),
                product_id: product.id_typed(),
                event_type: SupplyChainEventType::QualityCheck,
                location: "Lab".to_string(),
                metadata: Metadata::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        assert!(!change.mutates_product());
        product.apply(&change);
        assert_eq!(product, before);
    }

    #[test]
    fn stamped_times_drop_sub_microsecond_precision() {
        let product_id = ProductId::new();
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let mut cmd = create_cmd(manufacturer(), product_id);
        cmd.occurred_at = at;
        let mut product = Product::empty(product_id);
        let change = product.handle(&ProductCommand::CreateProduct(cmd)).unwrap();
        product.apply(&change);

        let expected = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(product.created_at(), expected);
        assert_eq!(product.updated_at(), expected);

        let change = product
            .handle(&ProductCommand::TransferProduct(TransferProduct {
                actor: manufacturer(),
                product_id,
                to_actor_id: Some(ActorId::new("U2")),
                location: "Dock".to_string(),
                metadata: Metadata::new(),
                occurred_at: at + chrono::Duration::nanoseconds(999),
            }))
            .unwrap();
        product.apply(&change);
        assert_eq!(product.updated_at().timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn recall_and_quality_check_need_no_metadata_and_keep_what_is_given() {
        let product = created_product();
        let inspector = Actor::new("inspector1", Role::Inspector);

        let recall = update_status(&product, inspector.clone(), ProductStatus::Recalled).unwrap();
        assert!(recall.to_new_event().metadata.get_str("reason").is_none());

        let change = product
            .handle(&ProductCommand::UpdateStatus(UpdateStatus {
                actor: inspector.clone(),
                product_id: product.id_typed(),
                new_status: ProductStatus::Recalled,
                location: "Lab".to_string(),
                metadata: Metadata::new().with("reason", "contamination"),
                occurred_at: Utc::now(),
            }))
            .unwrap();
        let event = change.to_new_event();
        assert_eq!(event.event_type, SupplyChainEventType::Recall);
        assert_eq!(event.metadata.get_str("reason"), Some("contamination"));

        for metadata in [Metadata::new(), Metadata::new().with("temperature", 4)] {
            let change = product
                .handle(&ProductCommand::AddEvent(AddEvent {
                    actor: inspector.clone(),
                    product_id: product.id_typed(),
                    event_type: SupplyChainEventType::QualityCheck,
                    location: "Lab".to_string(),
                    metadata: metadata.clone(),
                    occurred_at: Utc::now(),
                }))
                .unwrap();
            assert_eq!(change.to_new_event().metadata, metadata);
        }
    }

    #[test]
    fn manual_manufacture_annotation_is_rejected() {
        let product = created_product();
        let err = product
            .handle(&ProductCommand::AddEvent(AddEvent {
                actor: manufacturer(),
                product_id: product.id_typed(),
                event_type: SupplyChainEventType::Manufacture,
                location: String::new(),
                metadata: Metadata::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn ledger_token_is_write_once() {
        let mut product = created_product();
        assert_eq!(product.attach_ledger_token(LedgerTokenId::new("42")), Ok(true));
        assert_eq!(product.attach_ledger_token(LedgerTokenId::new("42")), Ok(false));
        assert!(matches!(
            product.attach_ledger_token(LedgerTokenId::new("43")),
            Err(DomainError::Conflict(_))
        ));
        assert_eq!(product.ledger_token_id(), Some(&LedgerTokenId::new("42")));
    }

    #[test]
    fn record_round_trip_preserves_state() {
        let product = created_product();
        assert_eq!(Product::rehydrate(product.to_record()), product);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = ProductStatus> {
            prop_oneof![
                Just(ProductStatus::Manufactured),
                Just(ProductStatus::InTransit),
                Just(ProductStatus::Delivered),
                Just(ProductStatus::Recalled),
            ]
        }

        proptest! {
            /// After N transfers the last destination holds custody and the
            /// product is in transit.
            #[test]
            fn custody_follows_the_last_transfer(hops in proptest::collection::vec("[A-Z][0-9]{1,3}", 1..12)) {
                let mut product = created_product();
                let mut holder = manufacturer();
                for to in &hops {
                    let change = transfer(&product, holder.clone(), to).unwrap();
                    product.apply(&change);
                    holder = Actor::new(to.as_str(), Role::Wholesaler);
                }
                prop_assert_eq!(product.current_custodian_id(), &ActorId::new(hops.last().unwrap().as_str()));
                prop_assert_eq!(product.status(), ProductStatus::InTransit);
                prop_assert_eq!(product.version(), 1 + hops.len() as u64);
            }

            /// Any status walk is accepted until Recalled, and nothing after.
            #[test]
            fn recalled_is_absorbing_under_any_walk(walk in proptest::collection::vec(any_status(), 1..16)) {
                let mut product = created_product();
                let admin = Actor::new("root", Role::Admin);
                for status in walk {
                    let was_recalled = product.status() == ProductStatus::Recalled;
                    match update_status(&product, admin.clone(), status) {
                        Ok(change) => {
                            prop_assert!(!was_recalled);
                            product.apply(&change);
                            prop_assert_eq!(product.status(), status);
                        }
                        Err(err) => {
                            prop_assert!(was_recalled);
                            prop_assert!(matches!(err, DomainError::Conflict(_)));
                        }
                    }
                }
            }
        }
    }
}
