//! Error types for the skald core.

/// Top-level error type for the session/intent coordination system.
#[derive(Debug, thiserror::Error)]
pub enum SkaldError {
    /// Message bus delivery or connection error.
    #[error("bus error: {0}")]
    Bus(String),

    /// Malformed or unparseable wire message.
    #[error("wire error: {0}")]
    Wire(String),

    /// A request/response exchange did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SkaldError>;
