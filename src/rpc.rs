//! Node API: a small JSON-RPC 2.0 surface over the `Master`, plus `/health`
//! and `/metrics` for operators.

use crate::cluster::{Master, MinedBlock};
use crate::metrics::MetricsHandle;
use crate::types::{Address, FullShardId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn invalid_params(msg: &str) -> JsonRpcError {
    JsonRpcError {
        code: -32602,
        message: format!("Invalid params: {msg}"),
        data: None,
    }
}

fn internal_error(msg: impl std::fmt::Display) -> JsonRpcError {
    JsonRpcError {
        code: -32000,
        message: msg.to_string(),
        data: None,
    }
}

/// Maps a `Master`-surfaced error to a JSON-RPC error, aborting the process
/// first if the error is a genuine chain-integrity violation rather than
/// ordinary bad input.
fn cluster_err(err: crate::error::ClusterError) -> JsonRpcError {
    err.abort_if_fatal();
    internal_error(err)
}

/// Dispatches the Node API over a shared `Master`. `Master` is behind a
/// single `Mutex` rather than per-field locks: every mutating call already
/// goes through its own `&mut self` methods, and the cluster has exactly one
/// Master, so there is no contention to shard.
pub struct RpcServer {
    master: Arc<Mutex<Master>>,
    metrics: Option<MetricsHandle>,
}

impl RpcServer {
    pub fn new(master: Arc<Mutex<Master>>) -> Self {
        Self { master, metrics: None }
    }

    pub fn set_metrics(&mut self, metrics: MetricsHandle) {
        self.metrics = Some(metrics);
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc != "2.0" {
            return JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                result: None,
                error: Some(JsonRpcError {
                    code: -32600,
                    message: "Invalid Request".to_string(),
                    data: None,
                }),
                id: request.id,
            };
        }

        let start = std::time::Instant::now();
        let result = match request.method.as_str() {
            "get_next_block_to_mine" => self.get_next_block_to_mine(request.params).await,
            "add_root_block" => self.add_root_block(request.params).await,
            "add_raw_minor_block" => self.add_raw_minor_block(request.params).await,
            "add_transaction" => self.add_transaction(request.params).await,
            "get_primary_account_data" => self.get_primary_account_data(request.params).await,
            "get_shard_status" => self.get_shard_status(request.params).await,
            other => Err(JsonRpcError {
                code: -32601,
                message: format!("method not found: {other}"),
                data: None,
            }),
        };
        if let Some(metrics) = &self.metrics {
            metrics.lock().unwrap().observe_rpc_latency(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(value) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                result: Some(value),
                error: None,
                id: request.id,
            },
            Err(error) => JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                result: None,
                error: Some(error),
                id: request.id,
            },
        }
    }

    async fn get_next_block_to_mine(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let coinbase: Address = serde_json::from_value(
            params.get("coinbase").cloned().ok_or_else(|| invalid_params("missing coinbase"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;
        let prefer_root = params.get("prefer_root").and_then(Value::as_bool).unwrap_or(false);

        let mut master = self.master.lock().await;
        let mined = master
            .get_next_block_to_mine(coinbase, prefer_root)
            .await
            .map_err(cluster_err)?;
        let value = match mined {
            MinedBlock::Root(block) => serde_json::json!({ "kind": "root", "block": block }),
            MinedBlock::Minor(block) => serde_json::json!({ "kind": "minor", "block": block }),
        };
        Ok(value)
    }

    async fn add_root_block(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let block = serde_json::from_value(
            params.get("block").cloned().ok_or_else(|| invalid_params("missing block"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;

        let mut master = self.master.lock().await;
        master.add_root_block(block).await.map_err(cluster_err)?;
        Ok(Value::Bool(true))
    }

    async fn add_raw_minor_block(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let branch: u32 = serde_json::from_value(
            params.get("branch").cloned().ok_or_else(|| invalid_params("missing branch"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;
        let hex_bytes: String = serde_json::from_value(
            params.get("data").cloned().ok_or_else(|| invalid_params("missing data"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;
        let bytes = hex::decode(hex_bytes).map_err(|e| invalid_params(&e.to_string()))?;

        let mut master = self.master.lock().await;
        master
            .add_raw_minor_block(FullShardId(branch), bytes)
            .await
            .map_err(cluster_err)?;
        Ok(Value::Bool(true))
    }

    async fn add_transaction(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let tx = serde_json::from_value(
            params.get("transaction").cloned().ok_or_else(|| invalid_params("missing transaction"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;

        let mut master = self.master.lock().await;
        master.add_transaction(tx).await.map_err(cluster_err)?;
        Ok(Value::Bool(true))
    }

    async fn get_primary_account_data(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let address: Address = serde_json::from_value(
            params.get("address").cloned().ok_or_else(|| invalid_params("missing address"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;

        let master = self.master.lock().await;
        let (balance, nonce) = master.get_primary_account_data(address).await.map_err(cluster_err)?;
        Ok(serde_json::json!({ "balance": balance.to_string(), "nonce": nonce }))
    }

    async fn get_shard_status(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| invalid_params("missing params"))?;
        let branch: u32 = serde_json::from_value(
            params.get("branch").cloned().ok_or_else(|| invalid_params("missing branch"))?,
        )
        .map_err(|e| invalid_params(&e.to_string()))?;

        let master = self.master.lock().await;
        let status = master.get_shard_status(FullShardId(branch)).await.map_err(cluster_err)?;
        Ok(serde_json::json!({
            "branch": status.branch.raw(),
            "tip_height": status.tip_height,
            "tip_hash": status.tip_hash.map(hex::encode),
            "mempool_size": status.mempool_size,
            "has_genesis": status.has_genesis,
        }))
    }
}

/// Minimal hand-rolled HTTP/1.1 server: POST / carries JSON-RPC bodies, GET
/// /health and GET /metrics are plain operator endpoints.
pub async fn serve(addr: std::net::SocketAddr, rpc_server: Arc<RpcServer>) -> crate::error::ClusterResult<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "json-rpc server listening");

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "rpc accept failed");
                continue;
            }
        };
        let rpc_server = rpc_server.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 1024 * 1024];
            let n = match stream.read(&mut buffer).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let request_str = String::from_utf8_lossy(&buffer[..n]);

            if request_str.starts_with("GET /health") {
                write_json_response(&mut stream, "200 OK", &serde_json::json!({"status": "healthy"})).await;
                return;
            }
            if request_str.starts_with("GET /metrics") {
                let body = rpc_server
                    .metrics
                    .as_ref()
                    .and_then(|m| m.lock().ok().and_then(|g| g.gather().ok()));
                match body {
                    Some(text) => {
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                            text.len(),
                            text
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    None => {
                        let _ = stream
                            .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
                            .await;
                    }
                }
                return;
            }

            let body = request_str
                .find("\r\n\r\n")
                .map(|i| &request_str[i + 4..])
                .unwrap_or(&request_str);

            match serde_json::from_str::<JsonRpcRequest>(body) {
                Ok(req) => {
                    let response = rpc_server.handle_request(req).await;
                    let json = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
                    write_raw_json(&mut stream, &json).await;
                }
                Err(_) => {
                    let error = r#"{"jsonrpc":"2.0","error":{"code":-32700,"message":"Parse error"},"id":null}"#;
                    write_raw_json(&mut stream, error).await;
                }
            }
        });
    }
}

async fn write_json_response(stream: &mut tokio::net::TcpStream, status: &str, value: &Value) {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    use tokio::io::AsyncWriteExt;
    let _ = stream.write_all(response.as_bytes()).await;
}

async fn write_raw_json(stream: &mut tokio::net::TcpStream, json: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
        json.len(),
        json
    );
    use tokio::io::AsyncWriteExt;
    let _ = stream.write_all(response.as_bytes()).await;
}
