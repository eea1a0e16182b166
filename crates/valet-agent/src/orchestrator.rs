//! Per-session conversation orchestration: the user → model → tool → result
//! → re-prompt loop, surfaced as a single ordered event stream per turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use valet_core::config::MAX_TOOL_HOPS;
use valet_core::types::{ChatMessage, History};
use valet_tools::{ToolCoordinator, ToolDefinition, ToolError};

use crate::parser::{ParserEvent, StreamParser};
use crate::prompt;
use crate::provider::{GenerationConfig, LlmAdapter, PromptBundle, ProviderError};

/// Everything a turn can emit, in emission order. Exactly one `EndOfTurn`
/// terminates every completed turn; a cancelled turn just stops.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Text(String),
    ToolCallIntent {
        name: String,
        arguments: Value,
    },
    ToolResultData {
        tool_name: String,
        result: Value,
    },
    /// The tool message about to be fed back to the model — informational.
    RePromptContext {
        message: ChatMessage,
    },
    Error {
        message: String,
        details: Option<Value>,
    },
    EndOfTurn,
}

/// The narrow tool capability the orchestrator needs: a catalog snapshot
/// and qualified-name dispatch.
#[async_trait]
pub trait ToolBroker: Send + Sync {
    fn catalog(&self) -> BTreeMap<String, ToolDefinition>;
    async fn call(&self, qualified_name: &str, arguments: Value) -> Result<Value, ToolError>;
}

#[async_trait]
impl ToolBroker for ToolCoordinator {
    fn catalog(&self) -> BTreeMap<String, ToolDefinition> {
        self.list_tools()
    }

    async fn call(&self, qualified_name: &str, arguments: Value) -> Result<Value, ToolError> {
        self.call_tool(qualified_name, arguments).await
    }
}

/// Drives every session's conversation. Histories are in-memory only and
/// dropped when the owning connection goes away.
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    adapter: Arc<dyn LlmAdapter>,
    tools: Arc<dyn ToolBroker>,
    sessions: DashMap<String, Arc<Mutex<History>>>,
}

impl Orchestrator {
    pub fn new(adapter: Arc<dyn LlmAdapter>, tools: Arc<dyn ToolBroker>) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                adapter,
                tools,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Run one user turn. Events arrive on the returned receiver in strict
    /// emission order. A second call for the same session while a turn is
    /// in flight is rejected with an error event (the gateway enforces
    /// one-in-flight per connection; this is the backstop).
    pub fn handle_input(
        &self,
        session_id: &str,
        text: &str,
        config: GenerationConfig,
        system_prompt: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(32);
        let inner = self.inner.clone();
        let session_id = session_id.to_string();
        let text = text.to_string();
        let system_prompt = system_prompt.to_string();

        tokio::spawn(async move {
            inner
                .run_turn(session_id, text, config, system_prompt, cancel, tx)
                .await;
        });

        rx
    }

    /// Forget a session entirely — called on client disconnect.
    pub fn drop_session(&self, session_id: &str) {
        if self.inner.sessions.remove(session_id).is_some() {
            debug!(%session_id, "session history dropped");
        }
    }
}

impl OrchestratorInner {
    async fn run_turn(
        &self,
        session_id: String,
        text: String,
        config: GenerationConfig,
        system_prompt: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<TurnEvent>,
    ) {
        info!(%session_id, "handling user input");

        let history_cell = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(History::new())))
            .clone();

        let Ok(mut history) = history_cell.try_lock() else {
            warn!(%session_id, "turn rejected: previous turn still processing");
            let _ = tx
                .send(TurnEvent::Error {
                    message: "A previous message is still being processed".to_string(),
                    details: None,
                })
                .await;
            let _ = tx.send(TurnEvent::EndOfTurn).await;
            return;
        };

        append(&session_id, &mut history, ChatMessage::user(text));

        let mut hops = 0;
        loop {
            if hops >= MAX_TOOL_HOPS {
                warn!(%session_id, hops, "tool hop limit reached, ending turn");
                let _ = tx
                    .send(TurnEvent::Error {
                        message: format!(
                            "Tool call limit of {MAX_TOOL_HOPS} reached for this turn"
                        ),
                        details: None,
                    })
                    .await;
                let _ = tx.send(TurnEvent::EndOfTurn).await;
                return;
            }

            let catalog = self.tools.catalog();
            let compiled = prompt::compile(&system_prompt, &catalog);
            let bundle = PromptBundle {
                system_prompt: compiled,
                history: history.snapshot(),
            };

            let (raw_tx, mut raw_rx) = mpsc::channel::<String>(32);
            let adapter = self.adapter.clone();
            let call_config = config.clone();
            let adapter_task = tokio::spawn(async move {
                adapter.stream_generate(&bundle, &call_config, raw_tx).await
            });

            let mut parser = StreamParser::new();
            let mut assistant_buffer = String::new();
            let mut tool_called = false;

            'stream: loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(%session_id, "turn cancelled");
                        adapter_task.abort();
                        return;
                    }
                    chunk = raw_rx.recv() => chunk,
                };

                let Some(chunk) = chunk else {
                    break 'stream;
                };

                for event in parser.feed(&chunk) {
                    match event {
                        ParserEvent::Text(content) => {
                            assistant_buffer.push_str(&content);
                            if tx.send(TurnEvent::Text(content)).await.is_err() {
                                adapter_task.abort();
                                return;
                            }
                        }
                        ParserEvent::ToolCall { name, arguments } => {
                            info!(%session_id, tool = %name, "tool intent received");
                            tool_called = true;

                            if !assistant_buffer.is_empty() {
                                append(
                                    &session_id,
                                    &mut history,
                                    ChatMessage::assistant(std::mem::take(
                                        &mut assistant_buffer,
                                    )),
                                );
                            }

                            if tx
                                .send(TurnEvent::ToolCallIntent {
                                    name: name.clone(),
                                    arguments: arguments.clone(),
                                })
                                .await
                                .is_err()
                            {
                                adapter_task.abort();
                                return;
                            }

                            let result = tokio::select! {
                                _ = cancel.cancelled() => {
                                    info!(%session_id, "cancelled during tool call");
                                    adapter_task.abort();
                                    return;
                                }
                                result = self.tools.call(&name, arguments) => result,
                            };

                            let tool_message = match result {
                                Ok(data) => ChatMessage::tool(&name, data),
                                Err(e) => {
                                    warn!(%session_id, tool = %name, error = %e, "tool call failed");
                                    ChatMessage::tool(
                                        &name,
                                        serde_json::json!({
                                            "error": e.class(),
                                            "message": e.to_string(),
                                        }),
                                    )
                                }
                            };

                            let payload =
                                tool_message.data.clone().unwrap_or(Value::Null);
                            if tx
                                .send(TurnEvent::ToolResultData {
                                    tool_name: name.clone(),
                                    result: payload,
                                })
                                .await
                                .is_err()
                            {
                                adapter_task.abort();
                                return;
                            }

                            append(&session_id, &mut history, tool_message.clone());

                            if tx
                                .send(TurnEvent::RePromptContext {
                                    message: tool_message,
                                })
                                .await
                                .is_err()
                            {
                                adapter_task.abort();
                                return;
                            }

                            // the rest of this model turn is superseded by
                            // the re-prompt
                            break;
                        }
                        ParserEvent::Error { message, details } => {
                            warn!(%session_id, %message, "parse error in model stream");
                            let _ = tx.send(TurnEvent::Error { message, details }).await;
                        }
                    }
                }

                if tool_called {
                    break 'stream;
                }
            }

            if tool_called {
                adapter_task.abort();
                let _ = adapter_task.await;
                hops += 1;
                continue;
            }

            // Stream closed with no tool call: flush the tail, surface any
            // provider failure, then finish the turn.
            for event in parser.finish() {
                if let ParserEvent::Text(content) = event {
                    assistant_buffer.push_str(&content);
                    let _ = tx.send(TurnEvent::Text(content)).await;
                }
            }

            match adapter_task.await {
                Ok(Ok(())) => {}
                // the consumer went away, not the provider — nothing to report
                Ok(Err(ProviderError::Cancelled)) => {
                    info!(%session_id, "provider stream cancelled");
                }
                Ok(Err(e)) => {
                    warn!(%session_id, error = %e, "provider error, ending turn");
                    let _ = tx
                        .send(TurnEvent::Error {
                            message: format!("LLM provider error: {e}"),
                            details: None,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(%session_id, error = %e, "adapter task panicked");
                    let _ = tx
                        .send(TurnEvent::Error {
                            message: "Internal error while streaming from the model"
                                .to_string(),
                            details: None,
                        })
                        .await;
                }
            }

            if !assistant_buffer.is_empty() {
                append(
                    &session_id,
                    &mut history,
                    ChatMessage::assistant(assistant_buffer),
                );
            }

            info!(%session_id, "finished processing user input");
            let _ = tx.send(TurnEvent::EndOfTurn).await;
            return;
        }
    }
}

/// Append with a structured debug trail of what entered the history.
fn append(session_id: &str, history: &mut History, message: ChatMessage) {
    let content_summary = message
        .content
        .as_deref()
        .map(|c| truncate(c, 150))
        .unwrap_or_default();
    debug!(
        session_id,
        role = ?message.role,
        content = %content_summary,
        tool = message.tool_name.as_deref().unwrap_or(""),
        has_data = message.data.is_some(),
        "history add"
    );
    history.push(message);
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use valet_core::config::MAX_HISTORY;
    use valet_core::types::Role;

    /// Adapter that plays back scripted fragment sequences, one per call.
    /// When the script runs out it repeats the last sequence.
    struct ScriptedAdapter {
        turns: std::sync::Mutex<VecDeque<Vec<String>>>,
        repeat_last: Option<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(turns: Vec<Vec<&str>>) -> Arc<Self> {
            Arc::new(Self {
                turns: std::sync::Mutex::new(
                    turns
                        .into_iter()
                        .map(|t| t.into_iter().map(String::from).collect())
                        .collect(),
                ),
                repeat_last: None,
            })
        }

        fn looping(fragments: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                turns: std::sync::Mutex::new(VecDeque::new()),
                repeat_last: Some(fragments.into_iter().map(String::from).collect()),
            })
        }
    }

    #[async_trait]
    impl LlmAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_generate(
            &self,
            _bundle: &PromptBundle,
            _config: &GenerationConfig,
            tx: mpsc::Sender<String>,
        ) -> Result<(), ProviderError> {
            let fragments = {
                let mut turns = self.turns.lock().unwrap();
                turns
                    .pop_front()
                    .or_else(|| self.repeat_last.clone())
                    .unwrap_or_default()
            };
            for fragment in fragments {
                let _ = tx.send(fragment).await;
            }
            Ok(())
        }
    }

    /// Adapter that emits one fragment then fails upstream.
    struct FailingAdapter;

    #[async_trait]
    impl LlmAdapter for FailingAdapter {
        fn name(&self) -> &str {
            "failing"
        }

        async fn stream_generate(
            &self,
            _bundle: &PromptBundle,
            _config: &GenerationConfig,
            tx: mpsc::Sender<String>,
        ) -> Result<(), ProviderError> {
            let _ = tx.send("partial".to_string()).await;
            Err(ProviderError::Api {
                status: 503,
                message: "overloaded".to_string(),
            })
        }
    }

    /// Adapter that never produces anything — the stream just hangs.
    struct PendingAdapter;

    #[async_trait]
    impl LlmAdapter for PendingAdapter {
        fn name(&self) -> &str {
            "pending"
        }

        async fn stream_generate(
            &self,
            _bundle: &PromptBundle,
            _config: &GenerationConfig,
            _tx: mpsc::Sender<String>,
        ) -> Result<(), ProviderError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Broker with no tools at all — every call is ToolNotFound.
    struct EmptyBroker;

    #[async_trait]
    impl ToolBroker for EmptyBroker {
        fn catalog(&self) -> BTreeMap<String, ToolDefinition> {
            BTreeMap::new()
        }

        async fn call(&self, qualified_name: &str, _arguments: Value) -> Result<Value, ToolError> {
            Err(ToolError::NotFound(qualified_name.to_string()))
        }
    }

    /// Broker exposing one tool that echoes its arguments back.
    struct EchoBroker;

    #[async_trait]
    impl ToolBroker for EchoBroker {
        fn catalog(&self) -> BTreeMap<String, ToolDefinition> {
            let mut map = BTreeMap::new();
            map.insert(
                "mem:search".to_string(),
                ToolDefinition {
                    name: "search".to_string(),
                    description: "search memory".to_string(),
                    parameters: serde_json::json!({"type": "object"}),
                },
            );
            map
        }

        async fn call(&self, _qualified_name: &str, arguments: Value) -> Result<Value, ToolError> {
            Ok(serde_json::json!({ "echo": arguments }))
        }
    }

    async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn end_count(events: &[TurnEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, TurnEvent::EndOfTurn))
            .count()
    }

    fn run(
        adapter: Arc<dyn LlmAdapter>,
        broker: Arc<dyn ToolBroker>,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(adapter, broker))
    }

    #[tokio::test]
    async fn plain_text_turn_emits_text_then_single_end() {
        let orch = run(
            ScriptedAdapter::new(vec![vec!["Hello ", "world."]]),
            Arc::new(EmptyBroker),
        );
        let rx = orch.handle_input(
            "s1",
            "hi",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        assert!(matches!(&events[0], TurnEvent::Text(t) if t == "Hello "));
        assert!(matches!(&events[1], TurnEvent::Text(t) if t == "world."));
        assert!(matches!(events.last(), Some(TurnEvent::EndOfTurn)));
        assert_eq!(end_count(&events), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_fed_back_and_turn_continues() {
        // S6: ghost tool against an empty registry — the failure becomes a
        // tool message the model can recover from.
        let orch = run(
            ScriptedAdapter::new(vec![
                vec!["```tool\n{\"tool\":\"ghost:op\",\"arguments\":{}}\n```"],
                vec!["Recovered."],
            ]),
            Arc::new(EmptyBroker),
        );
        let rx = orch.handle_input(
            "s1",
            "do it",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        assert!(matches!(
            &events[0],
            TurnEvent::ToolCallIntent { name, .. } if name == "ghost:op"
        ));
        let TurnEvent::ToolResultData { tool_name, result } = &events[1] else {
            panic!("expected ToolResultData, got {:?}", events[1]);
        };
        assert_eq!(tool_name, "ghost:op");
        assert_eq!(result["error"], "ToolNotFound");

        assert!(matches!(
            &events[2],
            TurnEvent::RePromptContext { message } if message.role == Role::Tool
        ));
        assert!(matches!(&events[3], TurnEvent::Text(t) if t == "Recovered."));
        assert_eq!(end_count(&events), 1);
    }

    #[tokio::test]
    async fn tool_round_trip_orders_events_and_reprompts() {
        let orch = run(
            ScriptedAdapter::new(vec![
                vec![
                    "Okay.\n",
                    "```tool\n{\"tool\":\"mem:search\",\"arguments\":{\"q\":\"x\"}}\n```",
                    " Done.",
                ],
                vec!["Found it."],
            ]),
            Arc::new(EchoBroker),
        );
        let rx = orch.handle_input(
            "s1",
            "search x",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        assert!(matches!(&events[0], TurnEvent::Text(t) if t == "Okay.\n"));
        assert!(matches!(&events[1], TurnEvent::ToolCallIntent { name, .. } if name == "mem:search"));
        let TurnEvent::ToolResultData { result, .. } = &events[2] else {
            panic!("expected ToolResultData");
        };
        assert_eq!(result["echo"]["q"], "x");
        assert!(matches!(&events[3], TurnEvent::RePromptContext { .. }));
        assert!(matches!(&events[4], TurnEvent::Text(t) if t == "Found it."));
        assert!(matches!(&events[5], TurnEvent::EndOfTurn));
        assert_eq!(events.len(), 6);

        // the model turn was superseded at the tool call — trailing text
        // from the first stream never surfaces
        assert!(!events
            .iter()
            .any(|e| matches!(e, TurnEvent::Text(t) if t.contains("Done"))));
    }

    #[tokio::test]
    async fn malformed_blob_yields_error_then_end() {
        // S3 at the orchestrator level.
        let orch = run(
            ScriptedAdapter::new(vec![vec!["```tool\n{not json}\n```"]]),
            Arc::new(EmptyBroker),
        );
        let rx = orch.handle_input(
            "s1",
            "hi",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TurnEvent::Error { .. }));
        assert!(matches!(&events[1], TurnEvent::EndOfTurn));
    }

    #[tokio::test]
    async fn provider_failure_surfaces_error_and_ends_turn() {
        let orch = run(Arc::new(FailingAdapter), Arc::new(EmptyBroker));
        let rx = orch.handle_input(
            "s1",
            "hi",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        assert!(matches!(&events[0], TurnEvent::Text(t) if t == "partial"));
        assert!(matches!(&events[1], TurnEvent::Error { .. }));
        assert!(matches!(&events[2], TurnEvent::EndOfTurn));
        assert_eq!(end_count(&events), 1);
    }

    #[tokio::test]
    async fn hop_limit_terminates_runaway_tool_loops() {
        let orch = run(
            ScriptedAdapter::looping(vec![
                "```tool\n{\"tool\":\"mem:search\",\"arguments\":{}}\n```",
            ]),
            Arc::new(EchoBroker),
        );
        let rx = orch.handle_input(
            "s1",
            "loop forever",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        let intents = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolCallIntent { .. }))
            .count();
        assert_eq!(intents, MAX_TOOL_HOPS);
        assert!(matches!(
            events[events.len() - 2],
            TurnEvent::Error { .. }
        ));
        assert!(matches!(events.last(), Some(TurnEvent::EndOfTurn)));
    }

    #[tokio::test]
    async fn history_never_exceeds_the_cap() {
        let orch = run(ScriptedAdapter::looping(vec!["ok"]), Arc::new(EmptyBroker));
        for i in 0..(MAX_HISTORY) {
            let rx = orch.handle_input(
                "s1",
                &format!("turn {i}"),
                GenerationConfig::default(),
                "prompt",
                CancellationToken::new(),
            );
            let _ = collect(rx).await;
        }

        let cell = orch.inner.sessions.get("s1").unwrap().clone();
        let history = cell.lock().await;
        assert_eq!(history.len(), MAX_HISTORY);
    }

    #[tokio::test]
    async fn concurrent_turn_on_same_session_is_rejected() {
        let orch = run(ScriptedAdapter::looping(vec!["ok"]), Arc::new(EmptyBroker));

        // occupy the session as an in-flight turn would
        let cell = orch
            .inner
            .sessions
            .entry("s1".to_string())
            .or_insert_with(|| Arc::new(Mutex::new(History::new())))
            .clone();
        let guard = cell.lock().await;

        let rx = orch.handle_input(
            "s1",
            "second message",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let events = collect(rx).await;
        drop(guard);

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TurnEvent::Error { .. }));
        assert!(matches!(&events[1], TurnEvent::EndOfTurn));
    }

    #[tokio::test]
    async fn cancelled_turn_stops_without_end_of_turn() {
        let orch = run(Arc::new(PendingAdapter), Arc::new(EmptyBroker));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let rx = orch.handle_input(
            "s1",
            "hi",
            GenerationConfig::default(),
            "prompt",
            cancel,
        );
        let events = collect(rx).await;
        assert_eq!(end_count(&events), 0);
    }

    #[tokio::test]
    async fn drop_session_forgets_history() {
        let orch = run(ScriptedAdapter::looping(vec!["ok"]), Arc::new(EmptyBroker));
        let rx = orch.handle_input(
            "s1",
            "hi",
            GenerationConfig::default(),
            "prompt",
            CancellationToken::new(),
        );
        let _ = collect(rx).await;
        assert!(orch.inner.sessions.contains_key("s1"));

        orch.drop_session("s1");
        assert!(!orch.inner.sessions.contains_key("s1"));
    }
}
