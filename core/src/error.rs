//! Error types for MeshQuery

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for MeshQuery operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Main error type for MeshQuery
#[derive(Error, Debug)]
pub enum RouterError {
    // ============ Caller-facing Errors ============
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Server timeout: received {received} of {needed} replies")]
    ServerTimeout { received: usize, needed: usize },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Unsupported blockchain: {0}")]
    UnsupportedBlockchain(String),

    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("Not enough nodes: found {found}, need {needed}")]
    NotEnoughNodes { found: usize, needed: usize },

    #[error("Max fee too low: found {found} affordable nodes, need {needed}")]
    MaxFeeTooLow { found: usize, needed: usize },

    #[error("Payment channel expired")]
    ExpiredPaymentChannel,

    // ============ Infrastructure Errors ============
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RouterError {
    /// Stable numeric code reported to callers and peers
    pub fn code(&self) -> i32 {
        match self {
            RouterError::Unauthorized(_) => 1001,
            RouterError::ServerTimeout { .. } => 1003,
            RouterError::BadRequest(_) | RouterError::MalformedPacket(_) => 1004,
            RouterError::InvalidParameters(_) => 1025,
            RouterError::InsufficientFunds(_) => 1026,
            RouterError::UnsupportedBlockchain(_) => 1027,
            RouterError::UnsupportedService(_) => 1028,
            RouterError::NotEnoughNodes { .. } => 1029,
            RouterError::MaxFeeTooLow { .. } => 1030,
            RouterError::ExpiredPaymentChannel => 1031,
            RouterError::InternalServerError(_)
            | RouterError::Storage(_)
            | RouterError::Serialization(_)
            | RouterError::Network(_)
            | RouterError::Config(_)
            | RouterError::Other(_) => 1002,
        }
    }

    /// Render this error as the structured object returned to callers
    pub fn into_reply(self, uuid: impl Into<String>) -> ErrorReply {
        ErrorReply {
            error: self.to_string(),
            code: self.code(),
            uuid: uuid.into(),
        }
    }
}

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        RouterError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RouterError {
    fn from(err: toml::de::Error) -> Self {
        RouterError::Config(err.to_string())
    }
}

/// Error object returned from the public query boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    pub code: i32,
    pub uuid: String,
}

impl ErrorReply {
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error": self.error,
            "code": self.code,
            "uuid": self.uuid,
        })
        .to_string()
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {}, uuid {})", self.error, self.code, self.uuid)
    }
}

/// Outcome of a public query: the consensus payload or a structured error
pub type QueryResult = Result<String, ErrorReply>;
