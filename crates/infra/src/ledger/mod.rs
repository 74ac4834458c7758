//! Ledger Anchor Client: the operations the system needs from the external
//! distributed ledger, nothing about its internals.
//!
//! - `client`: the transport-neutral trait and its typed outcomes
//! - `simulated`: deterministic in-process ledger for dev and tests
//! - `json_rpc`: JSON-RPC 2.0 over HTTP

pub mod client;
pub mod json_rpc;
pub mod simulated;

pub use client::{Confirmation, LedgerAnchorClient, LedgerError};
pub use json_rpc::{JsonRpcLedgerClient, JsonRpcLedgerConfig};
pub use simulated::{LedgerMode, SimulatedLedger, SimulatedSubmission, SubmissionKind};
