//! Anchor worker: drives each committed event to a final ledger outcome.
//!
//! ```text
//! Submit ──accepted──▶ Confirm ──Confirmed──▶ done (token folded back for creations)
//!   │                     │
//!   │ retryable error     │ Pending / retryable error
//!   ▼                     ▼
//! retry with backoff    poll again with backoff
//!   │                     │
//!   └──exhausted or refused / Failed──▶ event Failed + reconciliation signal
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use provenance_core::{ActorId, LedgerTokenId, ProductId, TxRef};
use provenance_events::{AnchorStatus, SupplyChainEvent, SupplyChainEventType};
use provenance_products::{Product, ProductStatus, STATUS_TO_KEY};

use super::coordinator::{CoordinatorConfig, Shared};
use super::signal::{ReconciliationKind, ReconciliationSignal};
use super::task::{AnchorPhase, AnchorTask, TaskQueue};
use crate::ledger::{Confirmation, LedgerAnchorClient, LedgerError};
use crate::store::{ProvenanceStore, StoreError};

/// The ledger call an event maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LedgerCall {
    Create(Box<Product>),
    Transfer { token: LedgerTokenId, to: ActorId },
    StatusUpdate { token: LedgerTokenId, status: ProductStatus },
    Event { token: LedgerTokenId },
}

/// Why a submission cannot be prepared right now.
#[derive(Debug)]
enum NotReady {
    /// The product has no ledger token yet.
    NoToken,
    Store(StoreError),
}

impl From<StoreError> for NotReady {
    fn from(value: StoreError) -> Self {
        NotReady::Store(value)
    }
}

/// Map a stored event onto its ledger call.
///
/// A status change is recognized by the `status_to` key the registry writes;
/// an `InTransit` status change without a recipient is not a custody transfer.
fn ledger_call(event: &SupplyChainEvent, product: Product) -> Result<LedgerCall, NotReady> {
    if event.event_type == SupplyChainEventType::Manufacture {
        return Ok(LedgerCall::Create(Box::new(product)));
    }

    let token = product.ledger_token_id().cloned().ok_or(NotReady::NoToken)?;

    if let (SupplyChainEventType::Transfer, Some(to)) = (event.event_type, &event.to_actor_id) {
        return Ok(LedgerCall::Transfer { token, to: to.clone() });
    }

    match event
        .metadata
        .get_str(STATUS_TO_KEY)
        .and_then(|s| s.parse::<ProductStatus>().ok())
    {
        Some(status) => Ok(LedgerCall::StatusUpdate { token, status }),
        None => Ok(LedgerCall::Event { token }),
    }
}

pub(super) struct AnchorWorker<S, L> {
    store: S,
    ledger: L,
    config: CoordinatorConfig,
    shared: Arc<Shared>,
    queue: TaskQueue,
    /// Products whose creation anchor has not settled yet.
    creating: HashSet<ProductId>,
}

impl<S, L> AnchorWorker<S, L>
where
    S: ProvenanceStore,
    L: LedgerAnchorClient,
{
    pub(super) fn new(store: S, ledger: L, config: CoordinatorConfig, shared: Arc<Shared>) -> Self {
        Self {
            store,
            ledger,
            config,
            shared,
            queue: TaskQueue::new(),
            creating: HashSet::new(),
        }
    }

    pub(super) fn run(mut self, inbound: mpsc::Receiver<SupplyChainEvent>, shutdown: mpsc::Receiver<()>) {
        let mut inbound_open = true;

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let now = Instant::now();
            let due: Vec<AnchorTask> = std::iter::from_fn(|| self.queue.pop_due(now)).collect();
            for task in due {
                self.process(task);
            }

            let wait = self
                .queue
                .next_due()
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or(self.config.poll_interval)
                .min(self.config.poll_interval);

            if !inbound_open {
                thread::sleep(wait);
                continue;
            }

            match inbound.recv_timeout(wait) {
                Ok(event) => {
                    self.admit(event);
                    // Take whatever else is already waiting without blocking.
                    while let Ok(event) = inbound.try_recv() {
                        self.admit(event);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => inbound_open = false,
            }
        }

        if !self.queue.is_empty() {
            info!(abandoned = self.queue.len(), "anchor worker stopping with queued tasks");
        }
    }

    fn admit(&mut self, event: SupplyChainEvent) {
        let mut task = AnchorTask::new(event.id, event.product_id, event.sequence, Instant::now());
        if event.event_type == SupplyChainEventType::Manufacture {
            self.creating.insert(event.product_id);
            task = task.for_creation();
        }
        debug!(event_id = %event.id, product_id = %event.product_id, "anchor task queued");
        self.queue.admit(task);
    }

    fn process(&mut self, task: AnchorTask) {
        match task.phase.clone() {
            AnchorPhase::Submit => self.submit(task),
            AnchorPhase::Confirm { tx_ref } => self.confirm(task, tx_ref),
        }
    }

    fn submit(&mut self, task: AnchorTask) {
        if !self.queue.is_next_to_submit(&task) {
            return self.hold(task);
        }

        let event = match self.store.get_event(task.event_id) {
            Ok(Some(event)) => event,
            Ok(None) => {
                return self.give_up(task, ReconciliationKind::LocalStore, "event missing from the log".to_string());
            }
            Err(err) if err.is_retryable() => {
                return self.retry_submit(task, ReconciliationKind::LocalStore, err.to_string());
            }
            Err(err) => return self.give_up(task, ReconciliationKind::LocalStore, err.to_string()),
        };

        match (event.ledger_anchor_status, event.ledger_tx_ref.clone()) {
            (status, _) if status.is_terminal() => {
                self.queue.submit_settled(&task);
                if task.creation {
                    self.creating.remove(&task.product_id);
                }
                return self.shared.task_settled();
            }
            // Accepted earlier; only the confirmation is outstanding.
            (AnchorStatus::Pending, Some(tx_ref)) => return self.accepted(task, tx_ref),
            _ => {}
        }

        let call = match self
            .load_product(task.product_id)
            .and_then(|product| ledger_call(&event, product))
        {
            Ok(call) => call,
            Err(NotReady::NoToken) if self.creating.contains(&task.product_id) => return self.hold(task),
            Err(NotReady::NoToken) => {
                return self.retry_submit(
                    task,
                    ReconciliationKind::TokenUnavailable,
                    "product has no ledger token".to_string(),
                );
            }
            Err(NotReady::Store(err)) if err.is_retryable() => {
                return self.retry_submit(task, ReconciliationKind::LocalStore, err.to_string());
            }
            Err(NotReady::Store(err)) => return self.give_up(task, ReconciliationKind::LocalStore, err.to_string()),
        };

        let result = match &call {
            LedgerCall::Create(product) => self.ledger.submit_create(product),
            LedgerCall::Transfer { token, to } => self.ledger.submit_transfer(token, to),
            LedgerCall::StatusUpdate { token, status } => self.ledger.submit_status_update(token, *status),
            LedgerCall::Event { token } => {
                self.ledger
                    .submit_event(token, event.event_type, &event.location, &event.metadata)
            }
        };

        match result {
            Ok(tx_ref) => {
                self.shared.record(|s| s.submitted += 1);
                if let Err(err) = self
                    .store
                    .update_anchor_status(task.event_id, AnchorStatus::Pending, Some(&tx_ref))
                {
                    // The confirmation write carries the tx ref again.
                    warn!(event_id = %task.event_id, error = %err, "failed to record pending anchor");
                }
                self.accepted(task, tx_ref);
            }
            Err(err) => {
                self.shared.record(|s| s.submit_errors += 1);
                if err.is_retryable() {
                    self.retry_submit(task, ReconciliationKind::SubmitExhausted, err.to_string());
                } else {
                    self.give_up(task, ReconciliationKind::SubmitRejected, err.to_string());
                }
            }
        }
    }

    fn accepted(&mut self, mut task: AnchorTask, tx_ref: TxRef) {
        debug!(event_id = %task.event_id, tx_ref = %tx_ref, "anchor submission accepted");
        self.queue.submit_settled(&task);
        task.phase = AnchorPhase::Confirm { tx_ref };
        task.attempt = 0;
        task.next_retry_at = Instant::now() + self.config.confirm_retry.delay_for_attempt(1);
        self.queue.schedule(task);
    }

    fn confirm(&mut self, task: AnchorTask, tx_ref: TxRef) {
        match self.ledger.get_confirmation(&tx_ref) {
            Ok(Confirmation::Confirmed { ledger_token_id }) => self.confirmed(task, tx_ref, ledger_token_id),
            Ok(Confirmation::Failed { reason }) => self.give_up(task, ReconciliationKind::FailedOnLedger, reason),
            Ok(Confirmation::Pending) => self.retry_confirm(task, "transaction still pending".to_string()),
            Err(LedgerError::Rejected(reason)) => self.give_up(task, ReconciliationKind::FailedOnLedger, reason),
            Err(err) => self.retry_confirm(task, err.to_string()),
        }
    }

    fn confirmed(&mut self, task: AnchorTask, tx_ref: TxRef, token: Option<LedgerTokenId>) {
        if task.creation {
            match token {
                Some(token) => match self.store.set_ledger_token(task.product_id, &token) {
                    Ok(changed) => {
                        if changed {
                            self.shared.record(|s| s.tokens_folded += 1);
                        }
                        info!(product_id = %task.product_id, ledger_token_id = %token, "ledger token recorded");
                    }
                    Err(err) if err.is_retryable() => return self.retry_confirm(task, err.to_string()),
                    Err(StoreError::Conflict(reason)) => self.raise(&task, ReconciliationKind::TokenMismatch, reason),
                    Err(err) => self.raise(&task, ReconciliationKind::LocalStore, err.to_string()),
                },
                None => self.raise(
                    &task,
                    ReconciliationKind::TokenMismatch,
                    "creation confirmed without a ledger token".to_string(),
                ),
            }
            self.creating.remove(&task.product_id);
        }

        match self
            .store
            .update_anchor_status(task.event_id, AnchorStatus::Confirmed, Some(&tx_ref))
        {
            Ok(_) => {
                self.shared.record(|s| s.confirmed += 1);
                debug!(event_id = %task.event_id, tx_ref = %tx_ref, "event anchored");
            }
            Err(err) if err.is_retryable() => return self.retry_confirm(task, err.to_string()),
            Err(err) => self.raise(&task, ReconciliationKind::LocalStore, err.to_string()),
        }
        self.shared.task_settled();
    }

    fn retry_submit(&mut self, mut task: AnchorTask, kind: ReconciliationKind, reason: String) {
        task.attempt += 1;
        let policy = &self.config.submit_retry;
        if let Some(delay) = policy.next_delay(task.attempt) {
            debug!(event_id = %task.event_id, attempt = task.attempt, ?delay, %reason, "anchor submission retry scheduled");
            task.next_retry_at = Instant::now() + delay;
            self.queue.schedule(task);
        } else {
            let attempts = task.attempt;
            self.give_up(task, kind, format!("{reason} (after {attempts} attempts)"));
        }
    }

    fn retry_confirm(&mut self, mut task: AnchorTask, reason: String) {
        task.attempt += 1;
        let policy = &self.config.confirm_retry;
        if let Some(delay) = policy.next_delay(task.attempt) {
            task.next_retry_at = Instant::now() + delay;
            self.queue.schedule(task);
        } else {
            let attempts = task.attempt;
            self.give_up(
                task,
                ReconciliationKind::ConfirmationExhausted,
                format!("{reason} (after {attempts} polls)"),
            );
        }
    }

    /// Re-check later without consuming an attempt.
    fn hold(&mut self, mut task: AnchorTask) {
        task.next_retry_at = Instant::now() + self.config.prerequisite_wait;
        self.queue.schedule(task);
    }

    /// Mark the event `Failed` and ask for reconciliation. The business
    /// record is left as it is.
    fn give_up(&mut self, task: AnchorTask, kind: ReconciliationKind, reason: String) {
        if task.is_submitting() {
            self.queue.submit_settled(&task);
        }
        if task.creation {
            self.creating.remove(&task.product_id);
        }

        match self.store.update_anchor_status(task.event_id, AnchorStatus::Failed, None) {
            Ok(_) => self.shared.record(|s| s.failed += 1),
            Err(err) => error!(event_id = %task.event_id, error = %err, "failed to mark anchor as failed"),
        }

        self.raise(&task, kind, reason);
        self.shared.task_settled();
    }

    fn raise(&self, task: &AnchorTask, kind: ReconciliationKind, reason: String) {
        self.shared
            .raise(ReconciliationSignal::new(task.event_id, task.product_id, kind, reason));
    }

    fn load_product(&self, product_id: ProductId) -> Result<Product, NotReady> {
        self.store
            .get_product(product_id)?
            .ok_or_else(|| NotReady::Store(StoreError::NotFound(format!("product {product_id}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use provenance_core::{EventId, Metadata};
    use provenance_products::STATUS_FROM_KEY;

    fn event(event_type: SupplyChainEventType, to: Option<&str>, metadata: Metadata) -> SupplyChainEvent {
        SupplyChainEvent {
            id: EventId::new(),
            product_id: ProductId::new(),
            sequence: 2,
            event_type,
            actor_id: ActorId::new("U1"),
            from_actor_id: Some(ActorId::new("U1")),
            to_actor_id: to.map(ActorId::new),
            location: "Dock".to_string(),
            timestamp: Utc::now(),
            metadata,
            ledger_anchor_status: AnchorStatus::NotSubmitted,
            ledger_tx_ref: None,
        }
    }

    fn tokened_product() -> Product {
        let mut record = Product::empty(ProductId::new()).to_record();
        record.ledger_token_id = Some(LedgerTokenId::new("9"));
        Product::rehydrate(record)
    }

    #[test]
    fn transfers_with_a_recipient_map_to_ledger_transfers() {
        let call = ledger_call(
            &event(SupplyChainEventType::Transfer, Some("U2"), Metadata::new()),
            tokened_product(),
        )
        .unwrap();
        assert_eq!(
            call,
            LedgerCall::Transfer {
                token: LedgerTokenId::new("9"),
                to: ActorId::new("U2")
            }
        );
    }

    #[test]
    fn status_changes_map_to_status_updates() {
        let metadata = Metadata::new()
            .with(STATUS_FROM_KEY, "InTransit")
            .with(STATUS_TO_KEY, "Recalled");
        let call = ledger_call(&event(SupplyChainEventType::Recall, None, metadata), tokened_product()).unwrap();
        assert_eq!(
            call,
            LedgerCall::StatusUpdate {
                token: LedgerTokenId::new("9"),
                status: ProductStatus::Recalled
            }
        );
    }

    #[test]
    fn other_events_map_to_generic_submissions() {
        let call = ledger_call(
            &event(SupplyChainEventType::QualityCheck, None, Metadata::new().with("result", "pass")),
            tokened_product(),
        )
        .unwrap();
        assert!(matches!(call, LedgerCall::Event { .. }));
    }

    #[test]
    fn non_creation_events_need_a_token() {
        let untokened = Product::empty(ProductId::new());
        let result = ledger_call(&event(SupplyChainEventType::Transfer, Some("U2"), Metadata::new()), untokened);
        assert!(matches!(result, Err(NotReady::NoToken)));
    }
}
