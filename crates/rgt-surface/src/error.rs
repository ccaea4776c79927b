//! `SurfaceError` — errors raised by the exposure/receive surfaces (C2, C5).

/// Errors surfaced by [`crate::exposure::ExposureSurface`] and
/// [`crate::receive::ReceiveSurface`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("failed to allocate surface state for {chunk_count} chunks")]
    ResourceExhausted { chunk_count: u32 },

    #[error("chunk {index} re-exposed with different bytes than its first exposure")]
    InvariantViolation { index: u32 },

    #[error("chunk {index} out of range for a surface of {chunk_count} chunks")]
    IndexOutOfRange { index: u32, chunk_count: u32 },

    #[error("chunk {index} failed integrity verification during recovery re-exposure")]
    IntegrityFailure { index: u32 },

    #[error("chunk {index} exceeded max_retries and is permanently failed")]
    RetriesExhausted { index: u32 },
}
