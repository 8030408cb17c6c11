//! Shared wire protocol for the Agent <-> Server mTLS tunnel.
//!
//! Everything an Agent and a Server need to agree on without talking to
//! each other lives here: the envelope shapes, the line-framed codec,
//! stream-id generation and the mTLS session setup.

pub mod codec;
pub mod control_plane;
pub mod envelope;
pub mod error;
pub mod id;
pub mod tls;

pub use codec::EnvelopeCodec;
pub use control_plane::{ControlPlane, NoopControlPlane, StartOutcome};
pub use envelope::{
    ConnectAckPayload, ConnectClosePayload, ConnectDataPayload, ConnectOpenPayload, Envelope,
    HeaderMap, HttpRequestPayload, HttpResponsePayload,
};
pub use error::ProtocolError;
pub use id::new_stream_id;

/// Hard cap on a single encoded line, per the wire protocol.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Recommended maximum chunk size for a single `connect_data` payload.
pub const MAX_DATA_CHUNK_BYTES: usize = 32 * 1024;

/// Hop-by-hop headers per RFC 7230 §6.1 that must never cross the tunnel.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];
