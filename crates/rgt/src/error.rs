//! `SessionError` — the single error taxonomy surfaced at the session
//! handle boundary (§7). Every lower-layer failure funnels through one of
//! the `From` conversions below so call sites never hand-match a
//! `WireError`/`SurfaceError` variant themselves.

use rgt_core::wire::WireError;
use rgt_surface::SurfaceError;

/// Error kinds a session handle can return. No variant here panics across
/// the handle API (§7).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("packet referenced unknown exposure {exposure_id:032x}")]
    UnknownSession { exposure_id: u128 },

    #[error("integrity failure on chunk {index}")]
    IntegrityFailure { index: u32 },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    TransportError(String),
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        // Every WireError is, by construction, a packet-framing failure.
        SessionError::MalformedPacket(err.to_string())
    }
}

impl From<SurfaceError> for SessionError {
    fn from(err: SurfaceError) -> Self {
        match err {
            SurfaceError::ResourceExhausted { .. } => SessionError::ResourceExhausted(err.to_string()),
            SurfaceError::IntegrityFailure { index } => SessionError::IntegrityFailure { index },
            SurfaceError::InvariantViolation { .. }
            | SurfaceError::IndexOutOfRange { .. }
            | SurfaceError::RetriesExhausted { .. } => SessionError::MalformedPacket(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::TransportError(err.to_string())
    }
}
