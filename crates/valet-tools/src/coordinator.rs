use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ToolServersFile;
use crate::error::{Result, ToolError};
use crate::registry::{ToolDefinition, ToolRegistry};
use crate::supervisor::{run_server, ServerHandle, ServerState};

/// Launches, supervises, and routes calls to subprocess tool servers.
///
/// Each configured server gets its own supervisor task; `initialize` waits
/// (bounded) for every server to report ready or failed, and partial success
/// is the expected steady state. The merged catalog lives in the registry;
/// routing goes through the per-server session handles.
pub struct ToolCoordinator {
    config_path: PathBuf,
    registry: Arc<ToolRegistry>,
    sessions: Arc<DashMap<String, ServerHandle>>,
    server_cancels: DashMap<String, CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ToolCoordinator {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            registry: Arc::new(ToolRegistry::new()),
            sessions: Arc::new(DashMap::new()),
            server_cancels: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Launch every configured server and wait for each to report ready or
    /// failed, bounded by the setup deadline. Servers that miss the deadline
    /// are cancelled; the rest stay usable. Only an unreadable config is an
    /// error — individual server failures are not.
    pub async fn initialize(&self) -> Result<()> {
        let file = ToolServersFile::load(&self.config_path)?;

        if file.servers.is_empty() {
            warn!("no tool servers defined in configuration");
            return Ok(());
        }

        info!(count = file.servers.len(), "launching tool server tasks");

        let mut waiters = Vec::new();
        {
            let mut tasks = self.tasks.lock().await;
            for (server_id, server_config) in file.servers {
                let (ready_tx, ready_rx) = oneshot::channel();
                let cancel = self.shutdown.child_token();
                self.server_cancels.insert(server_id.clone(), cancel.clone());

                tasks.push(tokio::spawn(run_server(
                    server_id.clone(),
                    server_config,
                    self.registry.clone(),
                    self.sessions.clone(),
                    ready_tx,
                    cancel,
                )));
                waiters.push((server_id, ready_rx));
            }
        }

        let deadline = Instant::now() + Duration::from_secs(setup_timeout_secs());
        let mut successful: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for (server_id, ready_rx) in waiters {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, ready_rx).await {
                Ok(Ok(Ok(count))) => {
                    info!(%server_id, tools = count, "server ready");
                    successful.push(server_id);
                }
                Ok(Ok(Err(e))) => {
                    warn!(%server_id, error = %e, "server failed to initialize");
                    failed.push(server_id);
                }
                Ok(Err(_)) => {
                    warn!(%server_id, "supervisor exited without reporting");
                    failed.push(server_id);
                }
                Err(_) => {
                    warn!(%server_id, "server setup timed out, cancelling");
                    if let Some(cancel) = self.server_cancels.get(&server_id) {
                        cancel.cancel();
                    }
                    failed.push(server_id);
                }
            }
        }

        successful.sort();
        failed.sort();
        info!(
            ready = ?successful,
            failed = ?failed,
            "tool server initialization summary"
        );

        Ok(())
    }

    /// Consistent snapshot of the merged catalog, keyed by qualified name.
    pub fn list_tools(&self) -> BTreeMap<String, ToolDefinition> {
        self.registry.snapshot()
    }

    /// Dispatch a call to the owning server. Reliability and performance
    /// counters are updated on every outcome.
    pub async fn call_tool(&self, qualified_name: &str, arguments: Value) -> Result<Value> {
        info!(tool = qualified_name, "tool call requested");

        let (server_id, tool_name) = self
            .registry
            .resolve(qualified_name)
            .ok_or_else(|| ToolError::NotFound(qualified_name.to_string()))?;

        // Clone out of the map so no guard is held across the await.
        let (session, state, timeout_ms) = match self.sessions.get(&server_id) {
            Some(handle) => (
                handle.session.clone(),
                *handle.state.borrow(),
                handle.timeout_ms,
            ),
            None => {
                return Err(ToolError::Unavailable {
                    qualified_name: qualified_name.to_string(),
                    server_id,
                    state: ServerState::Stopped.to_string(),
                })
            }
        };

        if state != ServerState::Ready {
            return Err(ToolError::Unavailable {
                qualified_name: qualified_name.to_string(),
                server_id,
                state: state.to_string(),
            });
        }

        let started = Instant::now();
        let result = session.call_tool(&tool_name, arguments, timeout_ms).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                self.registry.record_success(qualified_name, latency_ms);
                info!(tool = qualified_name, latency_ms, "tool call succeeded");
            }
            Err(e) => {
                self.registry.record_failure(qualified_name);
                warn!(tool = qualified_name, error = %e, "tool call failed");
            }
        }

        result
    }

    /// Signal every server task to exit and wait for them (best effort).
    pub async fn shutdown(&self) {
        info!("shutting down tool coordinator");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                warn!("supervisor task did not finish within shutdown window");
            }
        }

        self.server_cancels.clear();
        self.registry.clear();
        info!("tool coordinator shut down");
    }
}

fn setup_timeout_secs() -> u64 {
    valet_core::config::ValetConfig::setup_timeout_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("valet-test-{}-{name}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn call_on_empty_registry_is_not_found() {
        let coordinator = ToolCoordinator::new("does-not-exist.json");
        let err = coordinator
            .call_tool("ghost:op", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert_eq!(err.class(), "ToolNotFound");
    }

    #[tokio::test]
    async fn missing_config_file_is_a_config_error() {
        let coordinator = ToolCoordinator::new("does-not-exist.json");
        let err = coordinator.initialize().await.unwrap_err();
        assert!(matches!(err, ToolError::Config(_)));
    }

    #[tokio::test]
    async fn empty_server_map_initializes_cleanly() {
        let path = write_temp_config("empty.json", r#"{"servers":{}}"#);
        let coordinator = ToolCoordinator::new(&path);
        coordinator.initialize().await.unwrap();
        assert!(coordinator.list_tools().is_empty());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn bad_servers_fail_without_failing_initialize() {
        // One server with an unsupported transport, one with no command:
        // both are skipped, initialize still succeeds, catalog stays empty.
        let path = write_temp_config(
            "partial.json",
            r#"{"servers":{
                "web":{"transport":"sse","url":"http://localhost"},
                "broken":{"transport":"stdio"}
            }}"#,
        );
        let coordinator = ToolCoordinator::new(&path);
        coordinator.initialize().await.unwrap();
        assert!(coordinator.list_tools().is_empty());
        coordinator.shutdown().await;
        let _ = std::fs::remove_file(path);
    }
}
