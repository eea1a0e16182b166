use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identification failed: {0}")]
    IdentifyFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Client protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ValetError {
    /// Short error code string surfaced to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            ValetError::Config(_) => "CONFIG_ERROR",
            ValetError::IdentifyFailed(_) => "IDENTIFY_FAILED",
            ValetError::AuthFailed(_) => "AUTH_FAILED",
            ValetError::Protocol(_) => "PROTOCOL_ERROR",
            ValetError::Serialization(_) => "SERIALIZATION_ERROR",
            ValetError::Io(_) => "IO_ERROR",
            ValetError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ValetError>;
