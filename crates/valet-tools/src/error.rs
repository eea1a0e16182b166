use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found in registry")]
    NotFound(String),

    #[error("Tool '{qualified_name}' unavailable: server '{server_id}' is {state}")]
    Unavailable {
        qualified_name: String,
        server_id: String,
        state: String,
    },

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Tool protocol error: {0}")]
    Protocol(String),

    #[error("Failed to launch server '{server_id}': {reason}")]
    Spawn { server_id: String, reason: String },

    #[error("Invalid tool server configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Error class name fed back to the model in the tool result message.
    ///
    /// Per-call timeouts count as unavailability: the server may still be
    /// healthy, but this call produced nothing the model can use.
    pub fn class(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "ToolNotFound",
            ToolError::Unavailable { .. } => "ToolUnavailable",
            ToolError::Timeout { .. } => "ToolUnavailable",
            _ => "ToolExecutionError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;
