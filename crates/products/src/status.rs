//! Product lifecycle state machine.
//!
//! `Manufactured`, `InTransit` and `Delivered` are mutually reachable (the
//! graph is intentionally permissive). `Recalled` is absorbing: once entered,
//! no status or custody transition is accepted.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use provenance_core::{DomainError, DomainResult};
use provenance_events::SupplyChainEventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductStatus {
    Manufactured,
    InTransit,
    Delivered,
    Recalled,
}

impl ProductStatus {
    pub const ALL: [ProductStatus; 4] = [
        ProductStatus::Manufactured,
        ProductStatus::InTransit,
        ProductStatus::Delivered,
        ProductStatus::Recalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Manufactured => "Manufactured",
            ProductStatus::InTransit => "InTransit",
            ProductStatus::Delivered => "Delivered",
            ProductStatus::Recalled => "Recalled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProductStatus::Recalled)
    }

    /// Validate a transition out of `self`.
    pub fn ensure_can_transition_to(self, next: ProductStatus) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::conflict(format!(
                "product is {self}; no further transition to {next} is allowed"
            )));
        }
        Ok(())
    }

    /// History entry type recorded for a status update into `self`.
    pub fn event_type(&self) -> SupplyChainEventType {
        match self {
            ProductStatus::Manufactured => SupplyChainEventType::QualityCheck,
            ProductStatus::InTransit => SupplyChainEventType::Transfer,
            ProductStatus::Delivered => SupplyChainEventType::Delivery,
            ProductStatus::Recalled => SupplyChainEventType::Recall,
        }
    }
}

impl core::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProductStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown product status '{s}'")))
    }
}
