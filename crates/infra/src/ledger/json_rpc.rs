//! JSON-RPC 2.0 ledger transport over HTTP.
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `anchor_submitCreate` | `{productId, name, sku, batchId, category, manufacturerId, contentMetadataRef}` | `{txRef}` |
//! | `anchor_submitTransfer` | `{ledgerTokenId, toActorId}` | `{txRef}` |
//! | `anchor_submitStatusUpdate` | `{ledgerTokenId, status}` | `{txRef}` |
//! | `anchor_submitEvent` | `{ledgerTokenId, eventType, location, metadata}` | `{txRef}` |
//! | `anchor_getConfirmation` | `{txRef}` | `{status: confirmed\|failed\|pending, ledgerTokenId?, reason?}` |

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use provenance_core::{ActorId, LedgerTokenId, Metadata, TxRef};
use provenance_events::SupplyChainEventType;
use provenance_products::{Product, ProductStatus};

use super::client::{Confirmation, LedgerAnchorClient, LedgerError};

/// JSON-RPC "internal error"; treated as a transient ledger-side fault.
const RPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone)]
pub struct JsonRpcLedgerConfig {
    pub endpoint: String,
    /// Whole-request timeout (connect + response).
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl JsonRpcLedgerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Blocking JSON-RPC client; called from the coordinator's anchor worker thread.
#[derive(Debug)]
pub struct JsonRpcLedgerClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResult {
    tx_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationResult {
    status: String,
    #[serde(default)]
    ledger_token_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl JsonRpcLedgerClient {
    pub fn new(config: JsonRpcLedgerConfig) -> Result<Self, LedgerError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: JsonValue) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request_body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        debug!(method, id, "ledger rpc call");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .map_err(|e| map_transport_error(method, e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::Unavailable(format!("{method}: HTTP {status}")));
        }
        if status.is_client_error() {
            return Err(LedgerError::Rejected(format!("{method}: HTTP {status}")));
        }

        let body: RpcResponse = response
            .json()
            .map_err(|e| LedgerError::Malformed(format!("{method}: failed to parse response: {e}")))?;

        decode_response(method, body)
    }
}

fn map_transport_error(method: &str, err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout(format!("{method}: {err}"))
    } else {
        LedgerError::Unavailable(format!("{method}: HTTP request failed: {err}"))
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, body: RpcResponse) -> Result<T, LedgerError> {
    if let Some(error) = body.error {
        warn!(method, code = error.code, message = %error.message, "ledger rpc error");
        return Err(if error.code == RPC_INTERNAL_ERROR {
            LedgerError::Unavailable(format!("{method}: {}", error.message))
        } else {
            LedgerError::Rejected(format!("{method}: {} ({})", error.message, error.code))
        });
    }

    let result = body
        .result
        .ok_or_else(|| LedgerError::Malformed(format!("{method}: no result in RPC response")))?;

    serde_json::from_value(result)
        .map_err(|e| LedgerError::Malformed(format!("{method}: failed to deserialize result: {e}")))
}

fn to_tx_ref(method: &str, result: SubmitResult) -> Result<TxRef, LedgerError> {
    if result.tx_ref.trim().is_empty() {
        return Err(LedgerError::Malformed(format!("{method}: empty txRef")));
    }
    Ok(TxRef::new(result.tx_ref))
}

fn to_confirmation(result: ConfirmationResult) -> Result<Confirmation, LedgerError> {
    match result.status.to_ascii_lowercase().as_str() {
        "confirmed" => Ok(Confirmation::Confirmed {
            ledger_token_id: result
                .ledger_token_id
                .filter(|t| !t.trim().is_empty())
                .map(LedgerTokenId::new),
        }),
        "failed" => Ok(Confirmation::Failed {
            reason: result.reason.unwrap_or_else(|| "failed on ledger".to_string()),
        }),
        "pending" => Ok(Confirmation::Pending),
        other => Err(LedgerError::Malformed(format!("unknown confirmation status '{other}'"))),
    }
}

impl LedgerAnchorClient for JsonRpcLedgerClient {
    fn submit_create(&self, product: &Product) -> Result<TxRef, LedgerError> {
        const METHOD: &str = "anchor_submitCreate";
        let result = self.call(
            METHOD,
            json!({
                "productId": product.id_typed().to_string(),
                "name": product.name(),
                "sku": product.sku(),
                "batchId": product.batch_id(),
                "category": product.category(),
                "manufacturerId": product.manufacturer_id().as_str(),
                "contentMetadataRef": product.content_metadata_ref(),
            }),
        )?;
        to_tx_ref(METHOD, result)
    }

    fn submit_transfer(&self, token: &LedgerTokenId, to_actor_id: &ActorId) -> Result<TxRef, LedgerError> {
        const METHOD: &str = "anchor_submitTransfer";
        let result = self.call(
            METHOD,
            json!({ "ledgerTokenId": token.as_str(), "toActorId": to_actor_id.as_str() }),
        )?;
        to_tx_ref(METHOD, result)
    }

    fn submit_status_update(&self, token: &LedgerTokenId, status: ProductStatus) -> Result<TxRef, LedgerError> {
        const METHOD: &str = "anchor_submitStatusUpdate";
        let result = self.call(
            METHOD,
            json!({ "ledgerTokenId": token.as_str(), "status": status.as_str() }),
        )?;
        to_tx_ref(METHOD, result)
    }

    fn submit_event(
        &self,
        token: &LedgerTokenId,
        event_type: SupplyChainEventType,
        location: &str,
        metadata: &Metadata,
    ) -> Result<TxRef, LedgerError> {
        const METHOD: &str = "anchor_submitEvent";
        let result = self.call(
            METHOD,
            json!({
                "ledgerTokenId": token.as_str(),
                "eventType": event_type.as_str(),
                "location": location,
                "metadata": metadata.to_json(),
            }),
        )?;
        to_tx_ref(METHOD, result)
    }

    fn get_confirmation(&self, tx_ref: &TxRef) -> Result<Confirmation, LedgerError> {
        let result = self.call("anchor_getConfirmation", json!({ "txRef": tx_ref.as_str() }))?;
        to_confirmation(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: JsonValue) -> RpcResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn submit_result_decodes_tx_ref() {
        let body = response(json!({"jsonrpc": "2.0", "id": 1, "result": {"txRef": "0xabc"}}));
        let result: SubmitResult = decode_response("anchor_submitCreate", body).unwrap();
        assert_eq!(to_tx_ref("anchor_submitCreate", result).unwrap(), TxRef::new("0xabc"));
    }

    #[test]
    fn rpc_errors_are_typed() {
        let body = response(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "bad token"}}));
        let err = decode_response::<SubmitResult>("anchor_submitTransfer", body).unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));

        let body = response(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32603, "message": "node syncing"}}));
        let err = decode_response::<SubmitResult>("anchor_submitTransfer", body).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_or_garbled_results_are_malformed() {
        let body = response(json!({"jsonrpc": "2.0", "id": 1}));
        assert!(matches!(
            decode_response::<SubmitResult>("m", body),
            Err(LedgerError::Malformed(_))
        ));

        let body = response(json!({"jsonrpc": "2.0", "id": 1, "result": {"hash": 7}}));
        assert!(matches!(
            decode_response::<SubmitResult>("m", body),
            Err(LedgerError::Malformed(_))
        ));

        let result = SubmitResult { tx_ref: " ".into() };
        assert!(matches!(to_tx_ref("m", result), Err(LedgerError::Malformed(_))));
    }

    #[test]
    fn confirmation_statuses_map_to_outcomes() {
        let decode = |v: JsonValue| {
            let body = response(json!({"jsonrpc": "2.0", "id": 1, "result": v}));
            to_confirmation(decode_response("anchor_getConfirmation", body).unwrap())
        };

        assert_eq!(
            decode(json!({"status": "confirmed", "ledgerTokenId": "77"})).unwrap(),
            Confirmation::Confirmed {
                ledger_token_id: Some(LedgerTokenId::new("77"))
            }
        );
        assert_eq!(decode(json!({"status": "pending"})).unwrap(), Confirmation::Pending);
        assert!(matches!(
            decode(json!({"status": "failed", "reason": "reverted"})).unwrap(),
            Confirmation::Failed { reason } if reason == "reverted"
        ));
        assert!(matches!(decode(json!({"status": "lost"})), Err(LedgerError::Malformed(_))));
    }

    #[test]
    fn unreachable_endpoint_is_unavailable_not_a_panic() {
        let client = JsonRpcLedgerClient::new(
            JsonRpcLedgerConfig::new("http://127.0.0.1:9/").with_timeout(Duration::from_millis(500)),
        )
        .unwrap();
        let err = client.get_confirmation(&TxRef::new("0x1")).unwrap_err();
        assert!(err.is_retryable());
    }
}
