//! Gemini adapter: streams `generateContent` SSE and maps the host's
//! conversation model onto Gemini's user/model role scheme.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use valet_core::types::{ChatMessage, Role};

use crate::provider::{GenerationConfig, LlmAdapter, PromptBundle, ProviderError};

/// Synthetic model reply acknowledging the prepended system prompt, so the
/// first real user message always follows a model turn.
const SYSTEM_ACK: &str = "Understood. I will follow these instructions.";

pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl GeminiAdapter {
    pub fn new(api_key: String, base_url: String, default_model: String) -> Self {
        let key_display = if api_key.len() > 8 {
            format!("{}...{}", &api_key[..4], &api_key[api_key.len() - 4..])
        } else {
            "******".to_string()
        };
        info!(model = %default_model, api_key = %key_display, "Gemini adapter initialized");
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            default_model,
        }
    }
}

#[async_trait]
impl LlmAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn stream_generate(
        &self,
        bundle: &PromptBundle,
        config: &GenerationConfig,
        tx: mpsc::Sender<String>,
    ) -> Result<(), ProviderError> {
        let contents = format_contents(&bundle.system_prompt, &bundle.history);
        if contents.is_empty() {
            warn!("formatted contents are empty, skipping API call");
            return Ok(());
        }

        let model = normalize_model(
            config.model.as_deref().unwrap_or(&self.default_model),
        );
        let url = format!(
            "{}/v1beta/{model}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );

        let mut body = serde_json::json!({ "contents": contents });
        let mut generation_config = serde_json::Map::new();
        if let Some(t) = config.temperature {
            generation_config.insert("temperature".to_string(), serde_json::json!(t));
        }
        if let Some(m) = config.max_output_tokens {
            generation_config.insert("maxOutputTokens".to_string(), serde_json::json!(m));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        debug!(%model, history = bundle.history.len(), "calling Gemini streaming API");

        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::Unavailable(e.to_string())
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Gemini API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        process_sse_stream(resp, tx).await
    }
}

/// `gemini-2.0-flash` and `models/gemini-2.0-flash` both resolve to the
/// `models/...` resource path the REST API expects.
fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// Convert the compiled prompt + history into Gemini `contents`.
///
/// The system prompt is prepended as a synthetic user/model exchange.
/// role=tool maps to role=user with the tool's data serialized behind a
/// `Result for tool '<name>':` header; role=system history entries are
/// internal-only and skipped.
fn format_contents(system_prompt: &str, history: &[ChatMessage]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();

    if !system_prompt.trim().is_empty() {
        contents.push(content_entry("user", system_prompt));
        contents.push(content_entry("model", SYSTEM_ACK));
    }

    let mut last_role: Option<&'static str> = if contents.is_empty() {
        None
    } else {
        Some("model")
    };

    for (i, message) in history.iter().enumerate() {
        let (mapped_role, text) = match message.role {
            Role::Assistant => {
                let Some(content) = message.content.as_deref() else {
                    continue;
                };
                ("model", content.to_string())
            }
            Role::User => {
                let Some(content) = message.content.as_deref() else {
                    continue;
                };
                ("user", content.to_string())
            }
            Role::Tool => {
                let Some(data) = &message.data else {
                    warn!(index = i, "history item has role 'tool' but no data, skipping");
                    continue;
                };
                let header = match message.tool_name.as_deref() {
                    Some(name) => format!("Result for tool '{name}':\n"),
                    None => "Tool Result:\n".to_string(),
                };
                ("user", format!("{header}{}", serialize_tool_data(data)))
            }
            Role::System => {
                warn!(index = i, "skipping history item with internal 'system' role");
                continue;
            }
        };

        if last_role == Some(mapped_role) {
            warn!(index = i, role = mapped_role, "appending consecutive same-role messages");
        }
        contents.push(content_entry(mapped_role, &text));
        last_role = Some(mapped_role);
    }

    contents
}

fn content_entry(role: &str, text: &str) -> Value {
    serde_json::json!({ "role": role, "parts": [{ "text": text }] })
}

fn serialize_tool_data(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Drain the SSE byte stream, forwarding every text part. Chunks with no
/// extractable text (safety blocks, bookkeeping frames) are skipped.
async fn process_sse_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<String>,
) -> Result<(), ProviderError> {
    use futures_util::StreamExt;

    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProviderError::Http)?;
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            let parsed: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!(err = %e, "unparseable SSE data line");
                    return Err(ProviderError::Parse(format!(
                        "malformed SSE data line: {e}"
                    )));
                }
            };

            let fragment = extract_text(&parsed);
            if fragment.is_empty() {
                continue;
            }
            if tx.send(fragment).await.is_err() {
                // receiver dropped — turn was cancelled downstream
                return Err(ProviderError::Cancelled);
            }
        }

        line_buf = remainder;
    }

    Ok(())
}

/// Concatenate the text parts of the first candidate, if any.
fn extract_text(chunk: &Value) -> String {
    chunk
        .pointer("/candidates/0/content/parts")
        .and_then(|parts| parts.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}
