use thiserror::Error;

/// Errors produced by the tidewire transport and session layer.
///
/// Message-level variants (`RateLimited`, `UnknownMethod`, `Handler`,
/// `MiddlewareBlocked`, and `Protocol` when ids can be salvaged) are turned
/// into `ok: false` responses. `Auth` and `Capacity` are connection-level
/// and reject the handshake or HTTP call outright.
#[derive(Error, Debug)]
pub enum TidewireError {
    #[error("Invalid request: {0}")]
    Protocol(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("Too many connections from {0}")]
    Capacity(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Unknown method {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    Handler(String),

    #[error("Request blocked")]
    MiddlewareBlocked,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmpv::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidewireError {
    /// Returns true when the error ends the connection instead of producing
    /// a per-request response.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Capacity(_))
    }
}

impl From<std::net::AddrParseError> for TidewireError {
    fn from(err: std::net::AddrParseError) -> Self {
        TidewireError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TidewireError>;
