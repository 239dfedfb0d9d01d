//! Chain JSON-RPC plumbing
//!
//! HTTPS client for request/response methods and a thin WSS subscription
//! wrapper for `eth_subscribe` streams. Every call carries an explicit
//! timeout; transient failures surface as `EndpointUnreachable` and are
//! retried (and counted) by the component that owns the I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{MipError, MipResult};
use crate::models::RawTransaction;

/// A log entry as returned in receipts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub status: Option<U256>,
    pub gas_used: U256,
    #[serde(default)]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub block_number: Option<U256>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s == U256::from(1u64)).unwrap_or(false)
    }
}

/// Block transactions come back as hashes or full objects depending on the
/// `full` flag of `eth_getBlockByNumber`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockTxs {
    Hashes(Vec<B256>),
    Full(Vec<RawTransaction>),
}

impl BlockTxs {
    pub fn hashes(&self) -> Vec<B256> {
        match self {
            BlockTxs::Hashes(h) => h.clone(),
            BlockTxs::Full(txs) => txs.iter().map(|t| t.hash).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: U256,
    pub hash: B256,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub timestamp: U256,
    #[serde(default = "empty_txs")]
    pub transactions: BlockTxs,
}

fn empty_txs() -> BlockTxs {
    BlockTxs::Hashes(Vec::new())
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct RpcResponse<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// HTTPS JSON-RPC client bound to one endpoint.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> MipResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MipError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> MipResult<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MipError::EndpointUnreachable(format!("{}: {e}", self.url)))?;

        let body: RpcResponse<R> = resp
            .json()
            .await
            .map_err(|e| MipError::ProtocolMismatch(format!("{method}: bad response: {e}")))?;

        if let Some(err) = body.error {
            return Err(MipError::ProtocolMismatch(format!(
                "{method}: rpc {}: {}",
                err.code, err.message
            )));
        }
        body.result
            .ok_or_else(|| MipError::ProtocolMismatch(format!("{method}: null result")))
    }

    /// Like `call` but where a null result is meaningful (unknown tx, etc).
    pub async fn call_opt<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> MipResult<Option<R>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MipError::EndpointUnreachable(format!("{}: {e}", self.url)))?;

        let body: RpcResponse<R> = resp
            .json()
            .await
            .map_err(|e| MipError::ProtocolMismatch(format!("{method}: bad response: {e}")))?;

        if let Some(err) = body.error {
            return Err(MipError::ProtocolMismatch(format!(
                "{method}: rpc {}: {}",
                err.code, err.message
            )));
        }
        Ok(body.result)
    }

    pub async fn get_transaction_by_hash(&self, hash: B256) -> MipResult<Option<RawTransaction>> {
        self.call_opt("eth_getTransactionByHash", json!([hash])).await
    }

    pub async fn get_transaction_receipt(&self, hash: B256) -> MipResult<Option<TxReceipt>> {
        self.call_opt("eth_getTransactionReceipt", json!([hash])).await
    }

    pub async fn block_number(&self) -> MipResult<u64> {
        let n: U256 = self.call("eth_blockNumber", json!([])).await?;
        Ok(n.saturating_to())
    }

    pub async fn get_block_by_number(&self, number: u64, full: bool) -> MipResult<Option<Block>> {
        self.call_opt(
            "eth_getBlockByNumber",
            json!([format!("0x{number:x}"), full]),
        )
        .await
    }

    pub async fn latest_block(&self, full: bool) -> MipResult<Option<Block>> {
        self.call_opt("eth_getBlockByNumber", json!(["latest", full]))
            .await
    }

    pub async fn get_balance(&self, addr: Address) -> MipResult<U256> {
        self.call("eth_getBalance", json!([addr, "latest"])).await
    }

    pub async fn get_code(&self, addr: Address) -> MipResult<Bytes> {
        self.call("eth_getCode", json!([addr, "latest"])).await
    }

    pub async fn get_storage_at(&self, addr: Address, slot: U256) -> MipResult<B256> {
        self.call(
            "eth_getStorageAt",
            json!([addr, format!("0x{slot:x}"), "latest"]),
        )
        .await
    }

    pub async fn get_transaction_count(&self, addr: Address) -> MipResult<u64> {
        let n: U256 = self
            .call("eth_getTransactionCount", json!([addr, "pending"]))
            .await?;
        Ok(n.saturating_to())
    }

    /// Install a server-side pending-tx filter. Servers without filter
    /// support reject this; callers fall back to head diffing.
    pub async fn new_pending_filter(&self) -> MipResult<String> {
        self.call("eth_newPendingTransactionFilter", json!([])).await
    }

    pub async fn filter_changes(&self, filter_id: &str) -> MipResult<Vec<B256>> {
        self.call("eth_getFilterChanges", json!([filter_id])).await
    }
}

/// An open `eth_subscribe` stream over WSS.
pub struct WsSubscription {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    pub subscription_id: String,
}

impl WsSubscription {
    /// Connect and subscribe. A failed handshake is `EndpointUnreachable`;
    /// the caller decides whether that is fatal (first connect) or a
    /// reconnect (steady state).
    pub async fn open(url: &str, kind: &str, timeout: Duration) -> MipResult<Self> {
        let connect = tokio_tungstenite::connect_async(url);
        let (mut stream, _) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| MipError::EndpointUnreachable(format!("{url}: handshake timeout")))?
            .map_err(|e| MipError::EndpointUnreachable(format!("{url}: {e}")))?;

        let req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": [kind],
        });
        stream
            .send(Message::Text(req.to_string()))
            .await
            .map_err(|e| MipError::EndpointUnreachable(format!("{url}: subscribe send: {e}")))?;

        // The first text frame answering our id carries the subscription id.
        let sub_id = loop {
            let frame = tokio::time::timeout(timeout, stream.next())
                .await
                .map_err(|_| MipError::EndpointUnreachable(format!("{url}: subscribe timeout")))?
                .ok_or_else(|| MipError::EndpointUnreachable(format!("{url}: closed")))?
                .map_err(|e| MipError::EndpointUnreachable(format!("{url}: {e}")))?;

            if let Message::Text(text) = frame {
                let v: Value = serde_json::from_str(&text)
                    .map_err(|e| MipError::ProtocolMismatch(format!("subscribe reply: {e}")))?;
                if let Some(err) = v.get("error") {
                    return Err(MipError::ProtocolMismatch(format!(
                        "eth_subscribe {kind}: {err}"
                    )));
                }
                if let Some(id) = v.get("result").and_then(Value::as_str) {
                    break id.to_string();
                }
                // Not our reply (server banter); keep reading.
                debug!(url, "ignoring pre-subscription frame");
            }
        };

        Ok(Self {
            stream,
            subscription_id: sub_id,
        })
    }

    /// Next notification payload (the `params.result` object), or `None`
    /// when the server closes the stream.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            let frame = self.stream.next().await?;
            let msg = match frame {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "websocket stream error");
                    return None;
                }
            };
            match msg {
                Message::Text(text) => {
                    let v: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "unparseable subscription frame");
                            continue;
                        }
                    };
                    if let Some(result) = v
                        .get("params")
                        .and_then(|p| p.get("result"))
                    {
                        return Some(result.clone());
                    }
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
