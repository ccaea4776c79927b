//! Reliable layer (C5) — per-chunk retry with exponential backoff and the
//! background recovery scan (§4.5).
//!
//! The backoff/give-up shape follows the reference daemon's recovery loop
//! (`tokio::time::interval`-driven periodic scan, NACK-count give-up
//! threshold); re-verifying the stored hash against freshly read bytes
//! before re-exposing is this crate's analogue of that loop's corruption
//! check.

use rgt_core::manifest::IntegrityMode;
use tracing::{debug, warn};

use crate::error::SurfaceError;
use crate::exposure::ExposureSurface;

/// Per-chunk retry/backoff policy driving the reliable layer.
#[derive(Debug, Clone, Copy)]
pub struct ReliablePolicy {
    pub base_backoff_ns: u64,
    pub max_retries: u32,
}

impl ReliablePolicy {
    pub fn new(base_backoff_ns: u64, max_retries: u32) -> Self {
        Self { base_backoff_ns, max_retries }
    }

    /// `base_backoff · 2^retries` for the given retry count, saturating
    /// rather than overflowing at high retry counts.
    fn backoff_for(&self, retries: u32) -> u64 {
        self.base_backoff_ns.saturating_mul(1u64 << retries.min(32))
    }

    /// Indices still pending retry (not yet given up) whose backoff window
    /// has elapsed as of `now_ns` (§4.5 step 1). Chunks that have exceeded
    /// `max_retries` are reported separately as `gave_up` and are handed off
    /// to the background recovery scan instead of being retried further here.
    pub fn due_for_retry(&self, surface: &ExposureSurface, now_ns: u64) -> RetryBatch {
        let mut ready = Vec::new();
        let mut gave_up = Vec::new();

        for index in surface.indices_pending_retry() {
            let Some(state) = surface.retry_state(index) else { continue };
            if state.retries > self.max_retries {
                gave_up.push(index);
                continue;
            }
            let due_at = state.last_attempt_ns.saturating_add(self.backoff_for(state.retries));
            if now_ns >= due_at {
                ready.push(index);
            }
        }

        for &index in &gave_up {
            surface.mark_failed(index);
            warn!(index, "chunk exceeded max_retries, giving up");
        }

        RetryBatch { ready, gave_up }
    }

    /// Record an immediate re-expose attempt for `index` (§4.5 step 2). The
    /// caller is responsible for actually re-emitting CHUNK_DATA.
    pub fn record_attempt(&self, surface: &ExposureSurface, index: u32, now_ns: u64) -> u32 {
        let retries = surface.record_retry_attempt(index, now_ns);
        debug!(index, retries, "re-exposing chunk");
        retries
    }

    /// Background recovery scan (§4.5 step 4): for every chunk still
    /// flagged `needs_retry`, re-read the original bytes from the surface
    /// and re-verify the stored hash. A mismatch here means the in-memory
    /// source was corrupted after the first successful `expose()` — that is
    /// fatal to the surface, unlike an ordinary send failure.
    pub fn recovery_scan(&self, surface: &ExposureSurface) -> Result<Vec<u32>, SurfaceError> {
        let mut reverified = Vec::new();
        for index in surface.indices_needing_retry() {
            let bytes = surface.chunk_bytes(index)?;
            // expose() recomputes and compares against the hash recorded at
            // first exposure; a mismatch here means the in-memory source
            // buffer was corrupted after that first exposure succeeded.
            if surface.manifest().integrity_mode != IntegrityMode::None
                && surface.expose(index, &bytes).is_err()
            {
                return Err(SurfaceError::IntegrityFailure { index });
            }
            surface.clear_retry_flag(index);
            reverified.push(index);
        }
        Ok(reverified)
    }
}

/// Result of a [`ReliablePolicy::due_for_retry`] scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryBatch {
    pub ready: Vec<u32>,
    pub gave_up: Vec<u32>,
}
