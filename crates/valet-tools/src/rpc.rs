//! Tool Protocol session: newline-delimited JSON-RPC 2.0 over a child
//! process's stdio. One session per server; requests may interleave, with
//! responses matched to callers by id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, ToolError};
use crate::registry::ToolDefinition;

type Responder = oneshot::Sender<Result<Value>>;

/// A live Tool Protocol session over a subprocess's stdin/stdout.
///
/// The reader task dispatches responses to pending callers and fails all
/// outstanding requests when the child's stdout closes.
pub struct TpSession {
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, Responder>>,
    writer: Mutex<Option<ChildStdin>>,
}

impl TpSession {
    /// Wire up a session and spawn its reader task.
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Arc<Self> {
        let session = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            writer: Mutex::new(Some(stdin)),
        });

        let pending = session.pending.clone();
        tokio::spawn(async move {
            read_loop(stdout, pending).await;
        });

        session
    }

    /// TP handshake. Must complete before any other operation.
    pub async fn initialize(&self, timeout_ms: u64) -> Result<Value> {
        self.request(
            "initialize",
            serde_json::json!({ "protocol": "tp/1.0", "client": "valet" }),
            timeout_ms,
        )
        .await
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self, timeout_ms: u64) -> Result<Vec<ToolDefinition>> {
        let result = self
            .request("tools/list", Value::Object(Default::default()), timeout_ms)
            .await?;

        let listing: ToolListing = serde_json::from_value(result)
            .map_err(|e| ToolError::Protocol(format!("malformed tools/list result: {e}")))?;

        Ok(listing
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description.unwrap_or_default(),
                parameters: t
                    .input_schema
                    .unwrap_or_else(|| Value::Object(Default::default())),
            })
            .collect())
    }

    /// Invoke a tool by its TP-level (unqualified) name.
    pub async fn call_tool(&self, name: &str, arguments: Value, timeout_ms: u64) -> Result<Value> {
        self.request(
            "tools/call",
            serde_json::json!({ "name": name, "arguments": arguments }),
            timeout_ms,
        )
        .await
    }

    /// Close the child's stdin — the conventional shutdown signal for a
    /// stdio server. Further requests fail.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
    }

    async fn request(&self, method: &str, params: Value, timeout_ms: u64) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_request(id, method, &params);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        {
            let mut guard = self.writer.lock().await;
            let Some(stdin) = guard.as_mut() else {
                self.pending.remove(&id);
                return Err(ToolError::Protocol("session is closed".to_string()));
            };
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.remove(&id);
                return Err(ToolError::Io(e));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.remove(&id);
                return Err(ToolError::Io(e));
            }
        }

        debug!(id, method, "TP request sent");

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ToolError::Protocol(
                "server closed before responding".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(ToolError::Timeout { ms: timeout_ms })
            }
        }
    }
}

/// Serialize one JSON-RPC request as a single line.
pub(crate) fn encode_request(id: u64, method: &str, params: &Value) -> String {
    let mut line = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string();
    line.push('\n');
    line
}

/// One parsed JSON-RPC response line.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

async fn read_loop(stdout: ChildStdout, pending: Arc<DashMap<u64, Responder>>) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response: RpcResponse = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "unparseable TP line, ignoring");
                continue;
            }
        };

        let Some(id) = response.id else {
            // server-initiated notification — nothing to route
            debug!("TP notification received, ignoring");
            continue;
        };

        let Some((_, responder)) = pending.remove(&id) else {
            warn!(id, "TP response for unknown or timed-out request");
            continue;
        };

        let outcome = match (response.result, response.error) {
            (_, Some(err)) => Err(ToolError::Execution(format!(
                "{} (code {})",
                err.message, err.code
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ToolError::Protocol(
                "response carried neither result nor error".to_string(),
            )),
        };
        let _ = responder.send(outcome);
    }

    // stdout closed — the child is gone; fail everything still waiting
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, responder)) = pending.remove(&id) {
            let _ = responder.send(Err(ToolError::Protocol(
                "server exited mid-request".to_string(),
            )));
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolListing {
    #[serde(default)]
    tools: Vec<RawTool>,
}

#[derive(Debug, Deserialize)]
struct RawTool {
    name: String,
    description: Option<String>,
    #[serde(rename = "inputSchema")]
    input_schema: Option<Value>,
}
