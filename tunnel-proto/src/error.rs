use thiserror::Error;

/// Fatal-to-the-session errors raised by the codec or the dispatcher.
///
/// Every variant here corresponds to a `ProtocolViolation` in spec §7:
/// the session is torn down, but the process keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line exceeded {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("malformed json: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("unknown envelope type {0:?}")]
    UnknownType(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// mTLS session establishment failures (spec §7 `TlsHandshake`).
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load certificate from {path}: {source}")]
    CertLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("CA bundle at {0} contained no usable certificates")]
    EmptyCaBundle(String),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("rustls configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("handshake timed out after {0:?}")]
    Timeout(std::time::Duration),
}
