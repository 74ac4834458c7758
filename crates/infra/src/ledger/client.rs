use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use provenance_core::{ActorId, LedgerTokenId, Metadata, TxRef};
use provenance_events::SupplyChainEventType;
use provenance_products::{Product, ProductStatus};

/// Typed ledger failure. Never a panic; the caller owns the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the submission; retrying the same payload will not help.
    #[error("ledger rejected submission: {0}")]
    Rejected(String),

    #[error("ledger call timed out: {0}")]
    Timeout(String),

    #[error("malformed ledger response: {0}")]
    Malformed(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Timeout(_))
    }
}

/// Outcome of polling a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    /// Final. A confirmed creation anchor carries the token it minted.
    Confirmed { ledger_token_id: Option<LedgerTokenId> },
    Failed { reason: String },
    Pending,
}

/// Ledger operations used by the synchronization coordinator.
///
/// Submission is at-least-once: a retried call may produce a second
/// transaction for the same local event.
pub trait LedgerAnchorClient: Send + Sync {
    fn submit_create(&self, product: &Product) -> Result<TxRef, LedgerError>;

    fn submit_transfer(&self, token: &LedgerTokenId, to_actor_id: &ActorId) -> Result<TxRef, LedgerError>;

    fn submit_status_update(&self, token: &LedgerTokenId, status: ProductStatus) -> Result<TxRef, LedgerError>;

    fn submit_event(
        &self,
        token: &LedgerTokenId,
        event_type: SupplyChainEventType,
        location: &str,
        metadata: &Metadata,
    ) -> Result<TxRef, LedgerError>;

    fn get_confirmation(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError>;
}

impl<L> LedgerAnchorClient for Arc<L>
where
    L: LedgerAnchorClient + ?Sized,
{
    fn submit_create(&self, product: &Product) -> Result<TxRef, LedgerError> {
        (**self).submit_create(product)
    }

    fn submit_transfer(&self, token: &LedgerTokenId, to_actor_id: &ActorId) -> Result<TxRef, LedgerError> {
        (**self).submit_transfer(token, to_actor_id)
    }

    fn submit_status_update(&self, token: &LedgerTokenId, status: ProductStatus) -> Result<TxRef, LedgerError> {
        (**self).submit_status_update(token, status)
    }

    fn submit_event(
        &self,
        token: &LedgerTokenId,
        event_type: SupplyChainEventType,
        location: &str,
        metadata: &Metadata,
    ) -> Result<TxRef, LedgerError> {
        (**self).submit_event(token, event_type, location, metadata)
    }

    fn get_confirmation(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError> {
        (**self).get_confirmation(tx_ref)
    }
}
