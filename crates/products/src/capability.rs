//! Authorization rules for registry operations.
//!
//! One table keyed by `{operation, role}` plus a custody requirement evaluated
//! against the product. Callers never check role strings themselves.

use provenance_auth::{Actor, Role};
use provenance_core::{DomainError, DomainResult};

use crate::product::Product;

/// Registry operation subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateProduct,
    TransferProduct,
    UpdateStatus,
    /// A status update whose target is `Recalled`.
    RecallProduct,
    AddEvent,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateProduct => "create_product",
            Operation::TransferProduct => "transfer_product",
            Operation::UpdateStatus => "update_status",
            Operation::RecallProduct => "recall_product",
            Operation::AddEvent => "add_event",
        }
    }
}

/// Relationship the actor must have with the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyRequirement {
    None,
    /// Actor must be the current custodian.
    Custodian,
    /// Actor must be the current custodian or the product's manufacturer.
    CustodianOrManufacturer,
}

#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub operation: Operation,
    pub roles: &'static [Role],
    pub custody: CustodyRequirement,
    /// Roles that skip the custody requirement.
    pub custody_exempt: &'static [Role],
}

const CHAIN_ROLES: &[Role] = &Role::ALL;

pub const CAPABILITIES: &[Capability] = &[
    Capability {
        operation: Operation::CreateProduct,
        roles: &[Role::Manufacturer, Role::Admin],
        custody: CustodyRequirement::None,
        custody_exempt: &[],
    },
    Capability {
        operation: Operation::TransferProduct,
        roles: CHAIN_ROLES,
        custody: CustodyRequirement::Custodian,
        custody_exempt: &[Role::Admin],
    },
    Capability {
        operation: Operation::UpdateStatus,
        roles: CHAIN_ROLES,
        custody: CustodyRequirement::CustodianOrManufacturer,
        custody_exempt: &[Role::Admin],
    },
    Capability {
        operation: Operation::RecallProduct,
        roles: CHAIN_ROLES,
        custody: CustodyRequirement::CustodianOrManufacturer,
        custody_exempt: &[Role::Admin, Role::Inspector],
    },
    Capability {
        operation: Operation::AddEvent,
        roles: CHAIN_ROLES,
        custody: CustodyRequirement::None,
        custody_exempt: &[],
    },
];

pub fn capability(operation: Operation) -> &'static Capability {
    CAPABILITIES
        .iter()
        .find(|c| c.operation == operation)
        .unwrap_or(&DENY_ALL)
}

const DENY_ALL: Capability = Capability {
    operation: Operation::AddEvent,
    roles: &[],
    custody: CustodyRequirement::None,
    custody_exempt: &[],
};

/// Check `actor` may perform `operation`, optionally against an existing product.
pub fn authorize(actor: &Actor, operation: Operation, product: Option<&Product>) -> DomainResult<()> {
    let cap = capability(operation);

    if !cap.roles.contains(&actor.role) {
        return Err(DomainError::unauthorized(format!(
            "role '{}' may not {}",
            actor.role,
            operation.as_str()
        )));
    }

    if cap.custody_exempt.contains(&actor.role) {
        return Ok(());
    }

    let Some(product) = product else {
        return Ok(());
    };

    let holds = match cap.custody {
        CustodyRequirement::None => true,
        CustodyRequirement::Custodian => product.current_custodian_id() == actor.id(),
        CustodyRequirement::CustodianOrManufacturer => {
            product.current_custodian_id() == actor.id() || product.manufacturer_id() == actor.id()
        }
    };

    if holds {
        Ok(())
    } else {
        Err(DomainError::unauthorized(format!(
            "actor '{}' lacks custody of product {} for {}",
            actor.actor_id,
            product.id_typed(),
            operation.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_has_exactly_one_entry() {
        for op in [
            Operation::CreateProduct,
            Operation::TransferProduct,
            Operation::UpdateStatus,
            Operation::RecallProduct,
            Operation::AddEvent,
        ] {
            assert_eq!(CAPABILITIES.iter().filter(|c| c.operation == op).count(), 1, "{op:?}");
        }
    }

    #[test]
    fn only_manufacturers_and_admins_create() {
        for role in Role::ALL {
            let allowed = authorize(&Actor::new("A", role), Operation::CreateProduct, None).is_ok();
            assert_eq!(allowed, matches!(role, Role::Manufacturer | Role::Admin), "{role}");
        }
    }

    #[test]
    fn every_chain_role_may_annotate() {
        for role in Role::ALL {
            assert!(authorize(&Actor::new("A", role), Operation::AddEvent, None).is_ok());
        }
    }
}
