use thiserror::Error;

/// Per-transaction errors surfaced to the proxy listener (spec §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("tunnel session disconnected")]
    Disconnected,

    #[error("no tunnel session available")]
    Unavailable,

    #[error("request timed out")]
    Timeout,

    #[error("agent is shutting down")]
    Shutdown,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}
