/// Pastel node JSON-RPC client.
///
/// Thin wrapper over the node's JSON-RPC 1.0 interface. Used for chain
/// height, preburn sends, address balances, storage fee quotes, ticket
/// lookups and offer-ticket creation.
///
/// Transport failures and 5xx responses are retryable; an error object in
/// an otherwise well-formed envelope is a node-side rejection and is not.
use std::collections::HashMap;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Node JSON-RPC endpoint (e.g., "http://localhost:19932").
    pub url: String,
    pub username: String,
    pub password: String,
}

/// JSON-RPC client for the Pastel node.
#[derive(Clone)]
pub struct PastelRpc {
    client: Client,
    config: RpcConfig,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<Value>,
}

/// Extract the result from a JSON-RPC envelope.
///
/// An `error` object means the node processed and rejected the call, so
/// the failure is reported as non-retryable.
fn unwrap_envelope(method: &str, envelope: RpcEnvelope) -> Result<Value> {
    if let Some(err) = envelope.error {
        if !err.is_null() {
            return Err(GatewayError::Rpc {
                message: format!("{method}: {err}"),
                retryable: false,
            });
        }
    }
    envelope.result.ok_or_else(|| GatewayError::Rpc {
        message: format!("{method}: empty result"),
        retryable: false,
    })
}

impl PastelRpc {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "pastel-gateway",
            "method": method,
            "params": params,
        });

        debug!(method, "rpc call");

        let resp = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Rpc {
                message: format!("{method}: {e}"),
                retryable: true,
            })?;

        let status = resp.status();
        if status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rpc {
                message: format!("{method}: HTTP {status}: {text}"),
                retryable: true,
            });
        }

        let envelope: RpcEnvelope = resp.json().await.map_err(|e| GatewayError::Rpc {
            message: format!("{method}: bad envelope: {e}"),
            retryable: false,
        })?;

        unwrap_envelope(method, envelope)
    }

    /// Current chain tip height.
    pub async fn get_block_count(&self) -> Result<i64> {
        let result = self.call("getblockcount", json!([])).await?;
        result.as_i64().ok_or_else(|| GatewayError::Rpc {
            message: "getblockcount: non-integer result".into(),
            retryable: false,
        })
    }

    /// Send coins to an address. Returns the transaction id.
    pub async fn send_to_address(&self, address: &str, amount: i64) -> Result<String> {
        let result = self
            .call("sendtoaddress", json!([address, amount]))
            .await?;
        result
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| GatewayError::Rpc {
                message: "sendtoaddress: non-string txid".into(),
                retryable: false,
            })
    }

    /// Spendable balance per wallet address.
    pub async fn list_address_amounts(&self) -> Result<HashMap<String, f64>> {
        let result = self.call("listaddressamounts", json!([])).await?;
        serde_json::from_value(result).map_err(|e| GatewayError::Rpc {
            message: format!("listaddressamounts: {e}"),
            retryable: false,
        })
    }

    /// Network storage fee per megabyte.
    pub async fn get_network_storage_fee(&self) -> Result<i64> {
        let result = self.call("storagefee", json!(["getnetworkfee"])).await?;
        result
            .get("networkfee")
            .and_then(Value::as_i64)
            .ok_or_else(|| GatewayError::Rpc {
                message: "storagefee: missing networkfee".into(),
                retryable: false,
            })
    }

    /// Action fee quote for a file of the given size in megabytes.
    /// Returns (cascade_fee, sense_fee) in whole coins.
    pub async fn get_action_fees(&self, size_mb: u64) -> Result<(i64, i64)> {
        let result = self
            .call("storagefee", json!(["getactionfees", size_mb]))
            .await?;
        let cascade = result
            .get("cascadefee")
            .and_then(Value::as_i64)
            .or_else(|| result.get("cascadefee").and_then(Value::as_f64).map(|f| f as i64));
        let sense = result
            .get("sensefee")
            .and_then(Value::as_i64)
            .or_else(|| result.get("sensefee").and_then(Value::as_f64).map(|f| f as i64));
        match (cascade, sense) {
            (Some(c), Some(s)) => Ok((c, s)),
            _ => Err(GatewayError::Rpc {
                message: "storagefee getactionfees: missing fee fields".into(),
                retryable: false,
            }),
        }
    }

    /// Find a registration ticket by key. `ticket_type` is "nft",
    /// "action", "collection" or "offer". Absence is not an error.
    pub async fn tickets_find(&self, ticket_type: &str, key: &str) -> Result<Option<Value>> {
        match self.call("tickets", json!(["find", ticket_type, key])).await {
            Ok(value) if value.is_null() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_retryable() => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Fetch a transaction, returning None when the node does not know it.
    pub async fn get_raw_transaction(&self, txid: &str) -> Result<Option<Value>> {
        match self.call("getrawtransaction", json!([txid, 1])).await {
            Ok(value) if value.is_null() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_retryable() => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Register an offer ticket transferring a registered item to the
    /// intended recipient for free.
    pub async fn create_offer_ticket(
        &self,
        act_ticket_txid: &str,
        pastel_id: &str,
        passphrase: &str,
        intended_recipient: &str,
    ) -> Result<String> {
        let result = self
            .call(
                "tickets",
                json!([
                    "register",
                    "offer",
                    act_ticket_txid,
                    0,
                    pastel_id,
                    passphrase,
                    0,
                    0,
                    1,
                    "",
                    intended_recipient,
                ]),
            )
            .await?;
        result
            .get("txid")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| GatewayError::Rpc {
                message: "tickets register offer: missing txid".into(),
                retryable: false,
            })
    }

    /// Verify a signature made by a PastelID.
    pub async fn verify_message(
        &self,
        message: &str,
        signature: &str,
        pastel_id: &str,
    ) -> Result<bool> {
        let result = self
            .call("pastelid", json!(["verify", message, signature, pastel_id]))
            .await?;
        Ok(result
            .get("verification")
            .and_then(Value::as_str)
            .map(|v| v == "OK")
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_with_result() {
        let envelope = RpcEnvelope {
            result: Some(json!(12345)),
            error: None,
        };
        let value = unwrap_envelope("getblockcount", envelope).unwrap();
        assert_eq!(value, json!(12345));
    }

    #[test]
    fn test_envelope_with_error_is_not_retryable() {
        let envelope = RpcEnvelope {
            result: None,
            error: Some(json!({"code": -8, "message": "Invalid txid"})),
        };
        let err = unwrap_envelope("getrawtransaction", envelope).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_envelope_null_error_uses_result() {
        let envelope = RpcEnvelope {
            result: Some(json!({"networkfee": 50})),
            error: Some(Value::Null),
        };
        let value = unwrap_envelope("storagefee", envelope).unwrap();
        assert_eq!(value["networkfee"], 50);
    }

    #[test]
    fn test_empty_envelope_is_error() {
        let envelope = RpcEnvelope {
            result: None,
            error: None,
        };
        assert!(unwrap_envelope("getblockcount", envelope).is_err());
    }
}
