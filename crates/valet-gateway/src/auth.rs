//! Authenticating front tier.
//!
//! Terminates the client connection, checks `auth` credentials against the
//! configured argon2 hashes, then opens an inner connection to the session
//! tier, sends the trusted `identify` frame for the verified email, and
//! bridges both directions verbatim until either side closes. The session
//! tier trusts the synthesized identify because the inner transport only
//! ever carries frames this tier produced.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite;
use tracing::{info, warn};

use valet_core::config::{CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};
use valet_protocol::frames::{encode_identify, ClientFrame, ServerFrame};

use crate::app::AppState;

/// Assemble the auth-tier router. Only /ws exists here — everything else
/// belongs to the inner tier.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(auth_ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn auth_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_auth_connection(socket, state))
}

async fn handle_auth_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(%conn_id, "new auth-tier connection");

    let (mut client_tx, mut client_rx) = socket.split();

    // ── Authentication phase ─────────────────────────────────────────────
    let first = match client_rx.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            info!(%conn_id, "closed before authenticating");
            return;
        }
    };

    let auth = ClientFrame::parse(&first).ok().and_then(|f| f.as_auth());
    let Some(auth) = auth else {
        warn!(%conn_id, "first frame was not a valid auth");
        reject(&mut client_tx, "Expected an auth frame").await;
        return;
    };

    let verified = state
        .config
        .users
        .get(&auth.email)
        .and_then(|user| user.password_hash.as_deref())
        .map(|hash| verify_password(hash, &auth.password))
        .unwrap_or(false);

    if !verified {
        warn!(%conn_id, email = %auth.email, "authentication failed");
        reject(&mut client_tx, "Invalid credentials").await;
        return;
    }

    if send_frame(&mut client_tx, &ServerFrame::auth_success())
        .await
        .is_err()
    {
        return;
    }
    info!(%conn_id, email = %auth.email, "client authenticated");

    // ── Open the inner session connection ────────────────────────────────
    let inner_url = inner_gateway_url(&state.config);
    let inner = match tokio_tungstenite::connect_async(inner_url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(%conn_id, error = %e, url = %inner_url, "inner gateway unreachable");
            let _ = client_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "Backend connection failed".into(),
                })))
                .await;
            return;
        }
    };
    let (mut inner_tx, mut inner_rx) = inner.split();

    // The one frame the inner tier trusts implicitly.
    if inner_tx
        .send(tungstenite::Message::Text(encode_identify(&auth.email).into()))
        .await
        .is_err()
    {
        warn!(%conn_id, "failed to send identify to inner gateway");
        return;
    }

    // ── Bridge verbatim in both directions ───────────────────────────────
    let client_to_inner = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forward = match msg {
                Message::Text(text) => tungstenite::Message::Text(text.to_string().into()),
                Message::Binary(data) => tungstenite::Message::Binary(data.to_vec()),
                Message::Close(_) => break,
                _ => continue,
            };
            if inner_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = inner_tx.send(tungstenite::Message::Close(None)).await;
    };

    let inner_to_client = async {
        while let Some(Ok(msg)) = inner_rx.next().await {
            let forward = match msg {
                tungstenite::Message::Text(text) => Message::Text(text.as_str().into()),
                tungstenite::Message::Binary(data) => Message::Binary(data.into()),
                tungstenite::Message::Close(_) => break,
                _ => continue,
            };
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(Message::Close(None)).await;
    };

    // Either side finishing tears down the whole bridge.
    tokio::select! {
        _ = client_to_inner => info!(%conn_id, "client side of bridge closed"),
        _ = inner_to_client => info!(%conn_id, "inner side of bridge closed"),
    }
    info!(%conn_id, "auth-tier connection ended");
}

/// Verify a password against an argon2 PHC hash string. Any malformed hash
/// verifies as false rather than erroring — the client only ever learns
/// "invalid credentials".
fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        warn!("stored password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

async fn reject(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    reason: &str,
) {
    let _ = send_frame(tx, &ServerFrame::auth_fail(reason)).await;
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "Authentication Failed".into(),
        })))
        .await;
}

/// The inner tier listens on the configured bind/port; a wildcard bind is
/// dialled via loopback.
fn inner_gateway_url(config: &valet_core::config::ValetConfig) -> String {
    let host = if config.gateway.bind == "0.0.0.0" {
        "127.0.0.1"
    } else {
        &config.gateway.bind
    };
    format!("ws://{host}:{}/ws", config.gateway.port)
}

async fn send_frame(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    tx.send(Message::Text(frame.to_json().into()))
        .await
        .map_err(axum::Error::new)
}
