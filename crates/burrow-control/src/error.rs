//! Session failure taxonomy

use burrow_proto::ChannelKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad version, unknown, disabled or expired key; the session never starts
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Requested port, or the whole dynamic range, is unavailable
    #[error("Port unavailable: {0}")]
    PortConflict(String),

    /// The host never dialed back; only the waiting connection is affected
    #[error("No {kind} data channel arrived for session id {session_id}")]
    RendezvousTimeout { kind: ChannelKind, session_id: u64 },

    /// The key ran dry; ends the whole session
    #[error("Quota exhausted for key {0}")]
    QuotaExhausted(String),

    /// Unparsable handshake or framing; drops the offending connection only
    #[error("Protocol corruption: {0}")]
    ProtocolCorruption(String),

    #[error("Heartbeat timeout after {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("Session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<burrow_proto::CodecError> for SessionError {
    fn from(e: burrow_proto::CodecError) -> Self {
        match e {
            burrow_proto::CodecError::Io(io) => SessionError::Io(io),
            other => SessionError::ProtocolCorruption(other.to_string()),
        }
    }
}

impl From<burrow_quota::KeyStoreError> for SessionError {
    fn from(e: burrow_quota::KeyStoreError) -> Self {
        SessionError::AuthFailure(format!("key lookup failed: {}", e))
    }
}
