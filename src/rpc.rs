//! Typed JSON-RPC 2.0 client for a chain node.
//!
//! One client exists per chain, bound to a single node URL. Every call is
//! wrapped in a hard timeout; transaction submission gets five times the
//! budget of a read. Failures are either *timeout* (deadline exceeded),
//! *transport* (network or node-reported error), or *not-available* (the
//! client has not verified the node yet).
//!
//! The node URL may carry basic-auth credentials; every externally visible
//! rendering of the client elides them.

use alloy_primitives::{Address, B256, Bytes, U64, U128, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

use crate::config::ChainConfig;
use crate::state::SyncProgress;

/// Connection attempts before chain verification gives up.
pub const CONNECT_RETRIES: u32 = 2;
/// Cadence of dynamic node-status refreshes, and the spacing of connect
/// retries.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of semi-static node-info refreshes.
pub const INFO_INTERVAL: Duration = Duration::from_secs(3600);

/// RPC failure.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The call did not resolve within its deadline.
    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
    /// The node reported an error for the call.
    #[error("node error for {method}: {message} (code {code})")]
    Node {
        method: &'static str,
        code: i64,
        message: String,
    },
    /// The call did not reach the node, or the response was unreadable.
    #[error("transport failure for {method}: {message}")]
    Transport {
        method: &'static str,
        message: String,
    },
    /// The node answered with something other than the expected shape.
    #[error("unexpected response for {method}: {detail}")]
    InvalidResponse {
        method: &'static str,
        detail: String,
    },
    /// The node serves a different chain than configured. Fatal for the
    /// chain; there is no retry that can fix it.
    #[error("node reports chain id {reported}, expected {expected}")]
    ChainIdMismatch { reported: u64, expected: u64 },
    /// The client has not completed node verification.
    #[error("node connection not available")]
    NotAvailable,
}

impl RpcError {
    /// Transport and timeout failures are worth retrying; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Timeout { .. } | RpcError::Transport { .. })
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// A block as returned by `eth_getBlockByNumber` with transaction hashes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    /// Absent for the pending block.
    pub number: Option<U64>,
    pub hash: Option<B256>,
    pub timestamp: U64,
    #[serde(default)]
    pub transactions: Vec<B256>,
}

/// A transaction as returned by `eth_getTransactionByHash`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub nonce: U64,
    pub block_hash: Option<B256>,
    pub block_number: Option<U64>,
    pub transaction_index: Option<U64>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: Option<U128>,
    pub gas: U64,
    pub input: Bytes,
    #[serde(default, rename = "type")]
    pub transaction_type: Option<U64>,
    pub v: Option<U64>,
    pub r: Option<U256>,
    pub s: Option<U256>,
}

/// A receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub block_hash: Option<B256>,
    pub block_number: Option<U64>,
    pub status: Option<U64>,
}

/// `eth_syncing` result: `false`, or progress while catching up.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SyncState {
    Done(bool),
    Syncing(SyncInfo),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    pub starting_block: U64,
    pub current_block: U64,
    pub highest_block: U64,
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncState::Syncing(_))
    }

    pub fn progress(&self) -> Option<SyncProgress> {
        match self {
            SyncState::Done(_) => None,
            SyncState::Syncing(info) => Some(SyncProgress {
                starting_block: info.starting_block.to::<u64>(),
                current_block: info.current_block.to::<u64>(),
                highest_block: info.highest_block.to::<u64>(),
            }),
        }
    }
}

/// Typed JSON-RPC client bound to one chain node.
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    display_url: String,
    timeout: Duration,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.display_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcClient {
    pub fn new(config: &ChainConfig) -> Result<Self, crate::config::ConfigError> {
        Ok(RpcClient {
            http: reqwest::Client::new(),
            url: config.node_url()?,
            display_url: config.display_url()?,
            timeout: config.rpc_timeout(),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(false),
        })
    }

    /// The node URL with credentials elided.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    /// Verifies the node against the configured chain id and opens the
    /// client for use.
    ///
    /// Transient failures are retried up to [`CONNECT_RETRIES`] times,
    /// spaced by [`STATUS_INTERVAL`]. A node reporting a different chain id
    /// fails immediately; that mismatch is fatal for the chain.
    pub async fn connect(&self, expected_chain_id: u64) -> Result<u64, RpcError> {
        let mut attempt = 0;
        let reported = loop {
            match self.chain_id_unchecked().await {
                Ok(id) => break id,
                Err(e) if e.is_transient() && attempt < CONNECT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        node = %self.display_url,
                        attempt,
                        error = %e,
                        "node connection failed, retrying"
                    );
                    tokio::time::sleep(STATUS_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        };
        if reported != expected_chain_id {
            return Err(RpcError::ChainIdMismatch {
                reported,
                expected: expected_chain_id,
            });
        }
        self.available.store(true, Ordering::Release);
        Ok(reported)
    }

    fn ensure_available(&self) -> Result<(), RpcError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::NotAvailable)
        }
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
        timeout: Duration,
    ) -> Result<R, RpcError> {
        self.ensure_available()?;
        self.call_unchecked(method, params, timeout).await
    }

    async fn call_unchecked<R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
        timeout: Duration,
    ) -> Result<R, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            jsonrpc: "2.0",
            method,
            params,
        };
        let exchange = async {
            let response = self
                .http
                .post(self.url.clone())
                .json(&request)
                .send()
                .await
                .map_err(|e| transport(method, e))?;
            let body: RpcResponse = response
                .json()
                .await
                .map_err(|e| transport(method, e))?;
            parse_response(method, body)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout { method, timeout })?
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256, RpcError> {
        self.call("eth_getBalance", json!([address, "latest"]), self.timeout)
            .await
    }

    pub async fn get_transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        let count: U64 = self
            .call(
                "eth_getTransactionCount",
                json!([address, "latest"]),
                self.timeout,
            )
            .await?;
        Ok(count.to::<u64>())
    }

    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        let number: U64 = self.call("eth_blockNumber", json!([]), self.timeout).await?;
        Ok(number.to::<u64>())
    }

    /// Fetches a block with its transaction hashes.
    pub async fn get_block_by_number(&self, number: u64) -> Result<Option<RpcBlock>, RpcError> {
        self.call(
            "eth_getBlockByNumber",
            json!([U64::from(number), false]),
            self.timeout,
        )
        .await
    }

    pub async fn get_transaction(&self, hash: B256) -> Result<Option<RpcTransaction>, RpcError> {
        self.call("eth_getTransactionByHash", json!([hash]), self.timeout)
            .await
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<RpcReceipt>, RpcError> {
        self.call("eth_getTransactionReceipt", json!([hash]), self.timeout)
            .await
    }

    pub async fn get_chain_id(&self) -> Result<u64, RpcError> {
        self.ensure_available()?;
        self.chain_id_unchecked().await
    }

    async fn chain_id_unchecked(&self) -> Result<u64, RpcError> {
        let id: U64 = self
            .call_unchecked("eth_chainId", json!([]), self.timeout)
            .await?;
        Ok(id.to::<u64>())
    }

    pub async fn get_network_id(&self) -> Result<String, RpcError> {
        self.call("net_version", json!([]), self.timeout).await
    }

    pub async fn get_node_info(&self) -> Result<String, RpcError> {
        self.call("web3_clientVersion", json!([]), self.timeout).await
    }

    pub async fn get_protocol_version(&self) -> Result<String, RpcError> {
        self.call("eth_protocolVersion", json!([]), self.timeout).await
    }

    pub async fn get_peer_count(&self) -> Result<u64, RpcError> {
        let peers: U64 = self.call("net_peerCount", json!([]), self.timeout).await?;
        Ok(peers.to::<u64>())
    }

    pub async fn get_gas_price(&self) -> Result<u128, RpcError> {
        let price: U128 = self.call("eth_gasPrice", json!([]), self.timeout).await?;
        Ok(price.to::<u128>())
    }

    pub async fn is_syncing(&self) -> Result<SyncState, RpcError> {
        self.call("eth_syncing", json!([]), self.timeout).await
    }

    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Option<Address>,
        data: &Bytes,
    ) -> Result<u64, RpcError> {
        let mut call_object = json!({ "from": from, "data": data });
        if let Some(to) = to {
            call_object["to"] = json!(to);
        }
        let gas: U64 = self
            .call("eth_estimateGas", json!([call_object]), self.timeout)
            .await?;
        Ok(gas.to::<u64>())
    }

    /// Submits a signed raw transaction. Gets five times the read timeout.
    pub async fn send_signed_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        self.call("eth_sendRawTransaction", json!([raw]), self.timeout * 5)
            .await
    }
}

fn transport(method: &'static str, error: reqwest::Error) -> RpcError {
    // The reqwest error may embed the node URL, credentials included.
    RpcError::Transport {
        method,
        message: error.without_url().to_string(),
    }
}

fn parse_response<R: DeserializeOwned>(
    method: &'static str,
    body: RpcResponse,
) -> Result<R, RpcError> {
    if let Some(error) = body.error {
        return Err(RpcError::Node {
            method,
            code: error.code,
            message: error.message,
        });
    }
    serde_json::from_value(body.result).map_err(|e| RpcError::InvalidResponse {
        method,
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: Value) -> RpcResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_quantity_result() {
        let body = response(json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"}));
        let number: U64 = parse_response("eth_blockNumber", body).unwrap();
        assert_eq!(number.to::<u64>(), 16);
    }

    #[test]
    fn null_result_parses_as_none() {
        let body = response(json!({"jsonrpc": "2.0", "id": 1, "result": null}));
        let tx: Option<RpcTransaction> = parse_response("eth_getTransactionByHash", body).unwrap();
        assert!(tx.is_none());
    }

    #[test]
    fn node_error_surfaces_as_transport_failure() {
        let body = response(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32000, "message": "nonce too low"}
        }));
        let result: Result<U64, _> = parse_response("eth_sendRawTransaction", body);
        match result.unwrap_err() {
            RpcError::Node { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "nonce too low");
            }
            other => panic!("expected node error, got {other:?}"),
        }
    }

    #[test]
    fn parses_block_with_transaction_hashes() {
        let block: RpcBlock = serde_json::from_value(json!({
            "number": "0x3e8",
            "hash": format!("0x{}", "ab".repeat(32)),
            "timestamp": "0x64b8c123",
            "transactions": [format!("0x{}", "cd".repeat(32))]
        }))
        .unwrap();
        assert_eq!(block.number.unwrap().to::<u64>(), 1000);
        assert_eq!(block.transactions.len(), 1);
    }

    #[test]
    fn parses_legacy_transaction_fields() {
        let tx: RpcTransaction = serde_json::from_value(json!({
            "hash": format!("0x{}", "ab".repeat(32)),
            "nonce": "0x1",
            "blockHash": format!("0x{}", "ee".repeat(32)),
            "blockNumber": "0x3e8",
            "transactionIndex": "0x0",
            "from": format!("0x{}", "11".repeat(20)),
            "to": format!("0x{}", "22".repeat(20)),
            "value": "0x0",
            "gasPrice": "0x3b9aca00",
            "gas": "0x5208",
            "input": "0x5746010000",
            "v": "0x1546d71",
            "r": format!("0x{}", "33".repeat(32)),
            "s": format!("0x{}", "44".repeat(32))
        }))
        .unwrap();
        assert_eq!(tx.nonce.to::<u64>(), 1);
        assert_eq!(tx.input.as_ref(), &[0x57, 0x46, 0x01, 0x00, 0x00]);
        assert!(tx.transaction_type.is_none());
    }

    #[test]
    fn syncing_parses_both_shapes() {
        let done: SyncState = serde_json::from_value(json!(false)).unwrap();
        assert!(!done.is_syncing());
        assert!(done.progress().is_none());

        let syncing: SyncState = serde_json::from_value(json!({
            "startingBlock": "0x0",
            "currentBlock": "0x1f4",
            "highestBlock": "0x3e8"
        }))
        .unwrap();
        assert!(syncing.is_syncing());
        assert_eq!(syncing.progress().unwrap().current_block, 500);
    }

    #[test]
    fn request_shape_matches_json_rpc_2() {
        let request = RpcRequest {
            id: 7,
            jsonrpc: "2.0",
            method: "eth_blockNumber",
            params: json!([]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "eth_blockNumber");
        assert!(value["params"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn operations_before_connect_are_not_available() {
        let config: ChainConfig = serde_json::from_value(json!({
            "name": "main",
            "rpcHost": "127.0.0.1",
            "rpcPort": 1,
            "chainID": 1
        }))
        .unwrap();
        let client = RpcClient::new(&config).unwrap();
        let result = client.get_block_number().await;
        assert!(matches!(result.unwrap_err(), RpcError::NotAvailable));
    }
}
