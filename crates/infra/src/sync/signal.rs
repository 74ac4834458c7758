use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use provenance_core::{EventId, ProductId};

/// Why an event needs operator reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconciliationKind {
    /// Submission kept failing until the attempt budget ran out.
    SubmitExhausted,
    /// The ledger refused the submission outright.
    SubmitRejected,
    /// The ledger reported the transaction as failed.
    FailedOnLedger,
    /// The transaction never settled within the polling budget.
    ConfirmationExhausted,
    /// The product's ledger token never became available.
    TokenUnavailable,
    /// Local state disagrees with the ledger (token overwrite, missing token).
    TokenMismatch,
    /// The event could not be loaded or updated locally.
    LocalStore,
}

impl ReconciliationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationKind::SubmitExhausted => "submit_exhausted",
            ReconciliationKind::SubmitRejected => "submit_rejected",
            ReconciliationKind::FailedOnLedger => "failed_on_ledger",
            ReconciliationKind::ConfirmationExhausted => "confirmation_exhausted",
            ReconciliationKind::TokenUnavailable => "token_unavailable",
            ReconciliationKind::TokenMismatch => "token_mismatch",
            ReconciliationKind::LocalStore => "local_store",
        }
    }
}

impl core::fmt::Display for ReconciliationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when local history and the ledger cannot be brought into agreement
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationSignal {
    pub event_id: EventId,
    pub product_id: ProductId,
    pub kind: ReconciliationKind,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

impl ReconciliationSignal {
    pub fn new(event_id: EventId, product_id: ProductId, kind: ReconciliationKind, reason: impl Into<String>) -> Self {
        Self {
            event_id,
            product_id,
            kind,
            reason: reason.into(),
            raised_at: Utc::now(),
        }
    }
}
