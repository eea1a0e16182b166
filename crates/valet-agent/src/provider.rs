use async_trait::async_trait;
use tokio::sync::mpsc;

use valet_core::types::ChatMessage;

/// Per-call generation overrides. Unset fields fall back to the adapter's
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// Everything an adapter needs for one model call: the compiled system
/// prompt and the ordered conversation history.
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
}

/// Common interface for LLM providers.
///
/// Raw text fragments flow through `tx` in model output order; the call
/// returns once the stream is exhausted. An `Err` return means the turn
/// failed upstream — whatever was already sent stands, and the caller
/// surfaces the error into its own event stream. Implementations must be
/// safe to call concurrently from different sessions.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    async fn stream_generate(
        &self,
        bundle: &PromptBundle,
        config: &GenerationConfig,
        tx: mpsc::Sender<String>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}
