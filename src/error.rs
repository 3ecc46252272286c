use thiserror::Error;

/// Main error type for the trading bot
#[derive(Error, Debug)]
pub enum BlitzError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Send attempted while the socket is not connected.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection dropped while a request was in flight. Outstanding
    /// requests are failed immediately rather than left to time out.
    #[error("Connection lost")]
    ConnectionLost,

    /// No data response arrived within the deadline. Terminal for this one
    /// call only; other in-flight requests are unaffected.
    #[error("Request {name} (id={request_id}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        name: String,
        request_id: String,
        timeout_ms: u64,
    },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // Trading errors
    #[error("Trade rejected (status {status}): {detail}")]
    TradeRejected { status: u16, detail: String },

    // Action dispatch errors
    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Unknown query method: {0}")]
    UnknownQuery(String),

    // Validation errors (hard failures; lenient decode warns instead)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Agent errors
    #[error("Agent error: {0}")]
    Agent(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for BlitzError
pub type Result<T> = std::result::Result<T, BlitzError>;
