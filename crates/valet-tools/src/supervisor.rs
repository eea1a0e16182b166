//! Per-server supervisor task: owns one tool-server subprocess from spawn to
//! exit, registers its catalog, and keeps the routing table honest about the
//! server's state.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{substitute_args, ServerConfig};
use crate::error::{Result, ToolError};
use crate::registry::ToolRegistry;
use crate::rpc::TpSession;

/// Grace period between closing stdin and force-killing a draining server.
const DRAIN_TIMEOUT_SECS: u64 = 5;

/// Lifecycle of one supervised tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Handshaking,
    Discovering,
    Ready,
    Draining,
    Stopped,
    FailedStart,
    Crashed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Handshaking => "handshaking",
            ServerState::Discovering => "discovering",
            ServerState::Ready => "ready",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
            ServerState::FailedStart => "failed-start",
            ServerState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Routing handle the coordinator uses to reach a live server.
#[derive(Clone)]
pub struct ServerHandle {
    pub session: Arc<TpSession>,
    pub state: watch::Receiver<ServerState>,
    pub timeout_ms: u64,
}

/// Run one server's full lifecycle. `ready` fires exactly once, with the
/// registered tool count on success or the reason the server never came up.
pub(crate) async fn run_server(
    server_id: String,
    config: ServerConfig,
    registry: Arc<ToolRegistry>,
    sessions: Arc<DashMap<String, ServerHandle>>,
    ready: oneshot::Sender<Result<usize>>,
    cancel: CancellationToken,
) {
    info!(%server_id, transport = %config.transport, "starting tool server");

    if config.transport != "stdio" {
        warn!(
            %server_id,
            transport = %config.transport,
            "unsupported transport, skipping server"
        );
        let _ = ready.send(Err(ToolError::Config(format!(
            "unsupported transport '{}'",
            config.transport
        ))));
        return;
    }

    let Some(command) = config.command.as_deref() else {
        let _ = ready.send(Err(ToolError::Config(format!(
            "missing command for stdio server '{server_id}'"
        ))));
        return;
    };

    let args = substitute_args(&server_id, &config.args);
    debug!(%server_id, command, ?args, "launching stdio server");

    let mut child = match Command::new(command)
        .args(&args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(%server_id, error = %e, "failed to spawn tool server");
            let _ = ready.send(Err(ToolError::Spawn {
                server_id,
                reason: e.to_string(),
            }));
            return;
        }
    };

    // stdin/stdout feed the TP session; stderr is drained into the log so a
    // chatty server can't block on a full pipe.
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = ready.send(Err(ToolError::Spawn {
            server_id,
            reason: "stdio handles unavailable".to_string(),
        }));
        return;
    };
    if let Some(stderr) = child.stderr.take() {
        let id = server_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server_id = %id, "server stderr: {line}");
            }
        });
    }

    let (state_tx, state_rx) = watch::channel(ServerState::Handshaking);
    let session = TpSession::new(stdin, stdout);

    sessions.insert(
        server_id.clone(),
        ServerHandle {
            session: session.clone(),
            state: state_rx,
            timeout_ms: config.timeout_ms,
        },
    );

    // Handshake + discovery, abortable by the coordinator (setup deadline).
    let setup = async {
        session.initialize(config.timeout_ms).await?;
        let _ = state_tx.send(ServerState::Discovering);
        session.list_tools(config.timeout_ms).await
    };

    let tools = tokio::select! {
        _ = cancel.cancelled() => {
            info!(%server_id, "cancelled during setup");
            let _ = state_tx.send(ServerState::Stopped);
            sessions.remove(&server_id);
            let _ = ready.send(Err(ToolError::Config("setup cancelled".to_string())));
            return;
        }
        result = setup => match result {
            Ok(tools) => tools,
            Err(e) => {
                warn!(%server_id, error = %e, "setup failed");
                let _ = state_tx.send(ServerState::Crashed);
                sessions.remove(&server_id);
                let _ = ready.send(Err(e));
                return;
            }
        }
    };

    let count = registry.register_server(&server_id, tools);
    let _ = state_tx.send(ServerState::Ready);
    if count > 0 {
        info!(%server_id, count, "registered tools");
    } else {
        info!(%server_id, "no tools discovered");
    }
    let _ = ready.send(Ok(count));

    // Steady state: hold until shutdown is signalled or the process dies.
    let crashed = tokio::select! {
        _ = cancel.cancelled() => false,
        status = child.wait() => {
            warn!(%server_id, ?status, "tool server exited unexpectedly");
            true
        }
    };

    if crashed {
        let _ = state_tx.send(ServerState::Crashed);
    } else {
        info!(%server_id, "shutdown signal received, draining");
        let _ = state_tx.send(ServerState::Draining);
        session.close().await;
        match tokio::time::timeout(Duration::from_secs(DRAIN_TIMEOUT_SECS), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(%server_id, "server ignored stdin close, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        let _ = state_tx.send(ServerState::Stopped);
    }

    registry.remove_server(&server_id);
    sessions.remove(&server_id);
    info!(%server_id, "supervisor task ending");
}
