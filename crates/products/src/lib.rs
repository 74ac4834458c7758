//! Product registry domain (pure decision logic, no IO).
//!
//! - `product`: the authoritative product aggregate, its commands and decided changes
//! - `status`: lifecycle state machine (`Recalled` is absorbing)
//! - `capability`: the `{operation, role}` authorization table

pub mod capability;
pub mod product;
pub mod status;

pub use capability::{CAPABILITIES, Capability, CustodyRequirement, Operation, authorize};
pub use product::{
    AddEvent, CreateProduct, LOCATION_KEY, Product, ProductChange, ProductCommand, ProductRecord,
    STATUS_FROM_KEY, STATUS_TO_KEY, TransferProduct, UpdateStatus,
};
pub use status::ProductStatus;
