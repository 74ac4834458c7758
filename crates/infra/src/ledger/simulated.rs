use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::debug;

use provenance_core::{ActorId, LedgerTokenId, Metadata, ProductId, TxRef};
use provenance_events::SupplyChainEventType;
use provenance_products::{Product, ProductStatus};

use super::client::{Confirmation, LedgerAnchorClient, LedgerError};

/// How the simulated ledger currently behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerMode {
    #[default]
    Healthy,
    /// Every call fails with `Unavailable`.
    Unavailable,
    /// Submissions fail with `Rejected`; polls still answer.
    RejectSubmissions,
    /// Submissions are accepted, confirmations come back `Failed`.
    FailConfirmations,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionKind {
    Create { product_id: ProductId },
    Transfer { token: LedgerTokenId, to: ActorId },
    StatusUpdate { token: LedgerTokenId, status: ProductStatus },
    Event { token: LedgerTokenId, event_type: SupplyChainEventType, location: String },
}

/// An accepted submission, in acceptance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSubmission {
    pub tx_ref: TxRef,
    pub kind: SubmissionKind,
}

#[derive(Debug)]
struct Tx {
    kind: SubmissionKind,
    polls: u32,
    outcome: Option<Confirmation>,
}

#[derive(Debug, Default)]
struct State {
    mode: LedgerMode,
    next_tx: u64,
    next_token: u64,
    txs: HashMap<TxRef, Tx>,
    accepted: Vec<SimulatedSubmission>,
    submit_calls: u64,
    poll_calls: u64,
}

/// Deterministic in-process ledger.
///
/// A transaction is `Pending` for `confirm_after_polls - 1` polls and settles
/// on the next one. Creation anchors mint sequential token ids.
#[derive(Debug)]
pub struct SimulatedLedger {
    confirm_after_polls: u32,
    latency: Duration,
    state: Mutex<State>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedLedger {
    pub fn new(confirm_after_polls: u32) -> Self {
        Self {
            confirm_after_polls: confirm_after_polls.max(1),
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_mode(self, mode: LedgerMode) -> Self {
        self.set_mode(mode);
        self
    }

    pub fn set_mode(&self, mode: LedgerMode) {
        if let Ok(mut state) = self.state.lock() {
            state.mode = mode;
        }
    }

    pub fn mode(&self) -> LedgerMode {
        self.state.lock().map(|s| s.mode).unwrap_or_default()
    }

    /// Accepted submissions, oldest first.
    pub fn submissions(&self) -> Vec<SimulatedSubmission> {
        self.state.lock().map(|s| s.accepted.clone()).unwrap_or_default()
    }

    /// Every submit call, accepted or not.
    pub fn submit_calls(&self) -> u64 {
        self.state.lock().map(|s| s.submit_calls).unwrap_or(0)
    }

    pub fn poll_calls(&self) -> u64 {
        self.state.lock().map(|s| s.poll_calls).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Unavailable("simulated ledger poisoned".to_string()))
    }

    fn submit(&self, kind: SubmissionKind) -> Result<TxRef, LedgerError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let mut state = self.lock()?;
        state.submit_calls += 1;

        match state.mode {
            LedgerMode::Unavailable => return Err(LedgerError::Unavailable("simulated outage".to_string())),
            LedgerMode::RejectSubmissions => return Err(LedgerError::Rejected("simulated rejection".to_string())),
            LedgerMode::Healthy | LedgerMode::FailConfirmations => {}
        }

        state.next_tx += 1;
        let tx_ref = TxRef::new(format!("0x{:064x}", state.next_tx));
        state.txs.insert(
            tx_ref.clone(),
            Tx {
                kind: kind.clone(),
                polls: 0,
                outcome: None,
            },
        );
        state.accepted.push(SimulatedSubmission {
            tx_ref: tx_ref.clone(),
            kind,
        });

        debug!(tx_ref = %tx_ref, "simulated ledger accepted submission");
        Ok(tx_ref)
    }
}

impl LedgerAnchorClient for SimulatedLedger {
    fn submit_create(&self, product: &Product) -> Result<TxRef, LedgerError> {
        self.submit(SubmissionKind::Create {
            product_id: product.id_typed(),
        })
    }

    fn submit_transfer(&self, token: &LedgerTokenId, to_actor_id: &ActorId) -> Result<TxRef, LedgerError> {
        self.submit(SubmissionKind::Transfer {
            token: token.clone(),
            to: to_actor_id.clone(),
        })
    }

    fn submit_status_update(&self, token: &LedgerTokenId, status: ProductStatus) -> Result<TxRef, LedgerError> {
        self.submit(SubmissionKind::StatusUpdate {
            token: token.clone(),
            status,
        })
    }

    fn submit_event(
        &self,
        token: &LedgerTokenId,
        event_type: SupplyChainEventType,
        location: &str,
        _metadata: &Metadata,
    ) -> Result<TxRef, LedgerError> {
        self.submit(SubmissionKind::Event {
            token: token.clone(),
            event_type,
            location: location.to_string(),
        })
    }

    fn get_confirmation(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        let mut state = self.lock()?;
        state.poll_calls += 1;

        let mode = state.mode;
        if mode == LedgerMode::Unavailable {
            return Err(LedgerError::Unavailable("simulated outage".to_string()));
        }

        let threshold = self.confirm_after_polls;
        let State { txs, next_token, .. } = &mut *state;
        let tx = txs
            .get_mut(tx_ref)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown transaction {tx_ref}")))?;

        if let Some(outcome) = &tx.outcome {
            return Ok(outcome.clone());
        }

        tx.polls += 1;
        if tx.polls < threshold {
            return Ok(Confirmation::Pending);
        }

        let outcome = if mode == LedgerMode::FailConfirmations {
            Confirmation::Failed {
                reason: "simulated on-ledger failure".to_string(),
            }
        } else {
            let ledger_token_id = match tx.kind {
                SubmissionKind::Create { .. } => {
                    *next_token += 1;
                    Some(LedgerTokenId::new(next_token.to_string()))
                }
                _ => None,
            };
            Confirmation::Confirmed { ledger_token_id }
        };

        tx.outcome = Some(outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provenance_core::{Aggregate, Metadata};
    use provenance_auth::{Actor, Role};
    use provenance_products::{CreateProduct, ProductCommand};

    fn product() -> Product {
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
                occurred_at: chrono::Utc::now(),
            }))
            .unwrap();
        product.apply(&change);
        product
    }

    #[test]
    fn creation_confirms_after_configured_polls_and_mints_a_token() {
        let ledger = SimulatedLedger::new(3);
        let tx = ledger.submit_create(&product()).unwrap();

        assert_eq!(ledger.get_confirmation(&tx).unwrap(), Confirmation::Pending);
        assert_eq!(ledger.get_confirmation(&tx).unwrap(), Confirmation::Pending);
        let confirmed = ledger.get_confirmation(&tx).unwrap();
        assert_eq!(
            confirmed,
            Confirmation::Confirmed {
                ledger_token_id: Some(LedgerTokenId::new("1"))
            }
        );

        // Settled outcomes are stable.
        assert_eq!(ledger.get_confirmation(&tx).unwrap(), confirmed);
    }

    #[test]
    fn non_creation_confirmations_carry_no_token() {
        let ledger = SimulatedLedger::new(1);
        let tx = ledger
            .submit_transfer(&LedgerTokenId::new("1"), &ActorId::new("U2"))
            .unwrap();
        assert_eq!(
            ledger.get_confirmation(&tx).unwrap(),
            Confirmation::Confirmed { ledger_token_id: None }
        );
    }

    #[test]
    fn modes_produce_typed_failures() {
        let ledger = SimulatedLedger::new(1).with_mode(LedgerMode::Unavailable);
        let err = ledger.submit_create(&product()).unwrap_err();
        assert!(err.is_retryable());

        ledger.set_mode(LedgerMode::RejectSubmissions);
        let err = ledger.submit_create(&product()).unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
        assert!(!err.is_retryable());

        ledger.set_mode(LedgerMode::FailConfirmations);
        let tx = ledger.submit_create(&product()).unwrap();
        assert!(matches!(ledger.get_confirmation(&tx).unwrap(), Confirmation::Failed { .. }));

        assert_eq!(ledger.submit_calls(), 3);
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[test]
    fn unknown_transaction_is_rejected() {
        let ledger = SimulatedLedger::default();
        assert!(matches!(
            ledger.get_confirmation(&TxRef::new("0xdead")),
            Err(LedgerError::Rejected(_))
        ));
    }
}
