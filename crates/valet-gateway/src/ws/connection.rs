//! Session-tier WebSocket handling.
//!
//! Each connection must identify first (`{"type":"identify","email":...}`),
//! either directly or via the trusted frame the auth tier synthesizes. After
//! that, `message` frames run one orchestrator turn each; frames are read
//! one at a time, so a message sent while a turn is streaming waits in the
//! socket until the turn's `end` frame has gone out (serialized, not
//! rejected). Disconnecting cancels the in-flight turn and drops the
//! session's history.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use valet_agent::prompt;
use valet_agent::{GenerationConfig, TurnEvent};
use valet_core::config::CLOSE_POLICY_VIOLATION;
use valet_protocol::frames::{ClientFrame, ServerFrame};

use crate::app::AppState;

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

/// What identification establishes for the lifetime of one connection.
struct SessionContext {
    email: String,
    system_prompt: String,
    started: std::time::Instant,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task — lives for the entire session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(%session_id, "new client connection");

    let (mut tx, mut rx) = socket.split();

    // ── Identification phase ─────────────────────────────────────────────
    let Some(session) = identify(&session_id, &mut tx, &mut rx, &state).await else {
        return;
    };

    // ── Message loop ─────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    loop {
        match rx.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = match ClientFrame::parse(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%session_id, error = %e, "malformed frame");
                        let _ = send(&mut tx, &ServerFrame::error("Invalid JSON frame", None))
                            .await;
                        continue;
                    }
                };

                let Some(message) = frame.as_message() else {
                    warn!(%session_id, frame_type = %frame.frame_type, "unsupported frame type");
                    let _ = send(
                        &mut tx,
                        &ServerFrame::error(
                            format!("Unsupported frame type '{}'", frame.frame_type),
                            None,
                        ),
                    )
                    .await;
                    continue;
                };

                info!(%session_id, chars = message.text.len(), "user message received");
                let done = stream_turn(
                    &session_id,
                    &message.text,
                    &session.system_prompt,
                    &state,
                    &cancel,
                    &mut tx,
                )
                .await;
                if !done {
                    break;
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(%session_id, error = %e, "socket error");
                break;
            }
            _ => {}
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────
    cancel.cancel();
    state.orchestrator.drop_session(&session_id);
    info!(
        %session_id,
        email = %session.email,
        lived_secs = session.started.elapsed().as_secs(),
        "connection closed, session dropped"
    );
}

/// Run the identification handshake. Returns the established session
/// context, or None after the connection has been failed and closed.
async fn identify(
    session_id: &str,
    tx: &mut WsSink,
    rx: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &Arc<AppState>,
) -> Option<SessionContext> {
    let first = loop {
        match rx.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(data))) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(%session_id, "closed before identification");
                return None;
            }
            Some(Err(e)) => {
                warn!(%session_id, error = %e, "socket error during identification");
                return None;
            }
            _ => {}
        }
    };

    let identify = ClientFrame::parse(&first)
        .ok()
        .and_then(|frame| frame.as_identify());

    let Some(identify) = identify else {
        warn!(%session_id, "first frame was not a valid identify");
        fail_identification(tx, "Expected an identify frame").await;
        return None;
    };

    let Some(user) = state.config.users.get(&identify.email) else {
        warn!(%session_id, email = %identify.email, "unknown identity");
        fail_identification(tx, "Unknown identity").await;
        return None;
    };

    let system_prompt = prompt::resolve_persona(&state.base_template, &user.persona);

    let ok = ServerFrame::identify_success(session_id);
    if send(tx, &ok).await.is_err() {
        return None;
    }

    info!(%session_id, email = %identify.email, "session established");
    Some(SessionContext {
        email: identify.email,
        system_prompt,
        started: std::time::Instant::now(),
    })
}

async fn fail_identification(tx: &mut WsSink, reason: &str) {
    let _ = send(tx, &ServerFrame::identify_fail(reason)).await;
    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: "Identification Failed".into(),
        })))
        .await;
}

/// Drive one orchestrator turn, forwarding every event as a wire frame.
/// Returns false when the client vanished and the connection should end.
async fn stream_turn(
    session_id: &str,
    text: &str,
    system_prompt: &str,
    state: &Arc<AppState>,
    cancel: &CancellationToken,
    tx: &mut WsSink,
) -> bool {
    let mut events = state.orchestrator.handle_input(
        session_id,
        text,
        turn_config(&state.config),
        system_prompt,
        cancel.child_token(),
    );

    let mut streamed_chars = 0usize;
    while let Some(event) = events.recv().await {
        if let TurnEvent::Text(content) = &event {
            streamed_chars += content.len();
        }
        let frame = encode_turn_event(event);
        if send(tx, &frame).await.is_err() {
            return false;
        }
    }

    info!(%session_id, streamed_chars, "turn streamed to client");
    true
}

fn turn_config(config: &valet_core::config::ValetConfig) -> GenerationConfig {
    GenerationConfig {
        model: None,
        temperature: config.llm.temperature,
        max_output_tokens: config.llm.max_output_tokens,
    }
}

/// Map an orchestrator event to its client wire frame.
fn encode_turn_event(event: TurnEvent) -> ServerFrame {
    match event {
        TurnEvent::Text(content) => ServerFrame::text(content),
        TurnEvent::ToolCallIntent { name, arguments } => {
            ServerFrame::calling_tool(name, arguments)
        }
        TurnEvent::ToolResultData { tool_name, result } => {
            // Value is serializable by construction; the substitution is the
            // safety net the wire contract promises for anything exotic.
            let result = if serde_json::to_string(&result).is_ok() {
                result
            } else {
                serde_json::json!({
                    "error": "Result data not JSON serializable",
                    "type": "unknown",
                })
            };
            ServerFrame::tool_result(tool_name, result)
        }
        TurnEvent::RePromptContext { message } => ServerFrame::re_prompt_context(message),
        TurnEvent::Error { message, details } => ServerFrame::error(message, details),
        TurnEvent::EndOfTurn => ServerFrame::end(),
    }
}

/// Serialize and send a frame over the WS sink.
async fn send(tx: &mut WsSink, frame: &ServerFrame) -> Result<(), axum::Error> {
    let json = frame.to_json();
    tx.send(Message::Text(json.into()))
        .await
        .map_err(axum::Error::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_events_map_to_expected_frame_types() {
        let cases = [
            (TurnEvent::Text("hi".into()), r#""type":"text""#),
            (
                TurnEvent::ToolCallIntent {
                    name: "a:b".into(),
                    arguments: serde_json::json!({}),
                },
                r#""type":"status""#,
            ),
            (
                TurnEvent::ToolResultData {
                    tool_name: "a:b".into(),
                    result: serde_json::json!({"ok": true}),
                },
                r#""type":"tool_result""#,
            ),
            (
                TurnEvent::RePromptContext {
                    message: valet_core::types::ChatMessage::tool(
                        "a:b",
                        serde_json::json!({}),
                    ),
                },
                r#""type":"re_prompt_context""#,
            ),
            (
                TurnEvent::Error {
                    message: "x".into(),
                    details: None,
                },
                r#""type":"error""#,
            ),
            (TurnEvent::EndOfTurn, r#""type":"end""#),
        ];

        for (event, expected) in cases {
            let json = encode_turn_event(event).to_json();
            assert!(json.contains(expected), "{json} missing {expected}");
        }
    }

    #[test]
    fn intent_frame_reports_calling_tool_state() {
        let frame = encode_turn_event(TurnEvent::ToolCallIntent {
            name: "mem:search".into(),
            arguments: serde_json::json!({"q": "x"}),
        });
        let json = frame.to_json();
        assert!(json.contains(r#""state":"calling_tool""#));
        assert!(json.contains(r#""tool":"mem:search""#));
    }
}
