//! `ExposureSurface` (C2) — sender-side owner of the bitmap, per-chunk
//! hashes, retry bookkeeping, and stats counters.
//!
//! Bookkeeping shape is grounded on the reference daemon's `FileAssembly`
//! (chunk-hash tracking, nack-driven stall counters) mirrored to the
//! sending side, plus its `TokenBucket`-style "a handful of atomics updated
//! under a tick" approach to stats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use rgt_core::manifest::{IntegrityMode, Manifest};

use crate::bitmap::ChunkBitmap;
use crate::error::SurfaceError;

/// Per-chunk retransmission bookkeeping (§3, §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryState {
    pub retries: u32,
    pub last_attempt_ns: u64,
    pub needs_retry: bool,
}

/// Lock-free snapshot of a surface's counters (§4.2 `snapshot_stats`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub acks_received: u64,
    pub nacks_received: u64,
    pub retrans: u64,
    pub failed_chunks: u64,
    pub exposure_rate: f64,
    pub congestion_window: u32,
    pub pull_pressure: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    bytes_sent: AtomicU64,
    chunks_sent: AtomicU64,
    acks_received: AtomicU64,
    nacks_received: AtomicU64,
    retrans: AtomicU64,
    failed_chunks: AtomicU64,
    exposure_rate_bits: AtomicU64,
    congestion_window: AtomicU32,
    pull_pressure: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> Stats {
        Stats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            nacks_received: self.nacks_received.load(Ordering::Relaxed),
            retrans: self.retrans.load(Ordering::Relaxed),
            failed_chunks: self.failed_chunks.load(Ordering::Relaxed),
            exposure_rate: f64::from_bits(self.exposure_rate_bits.load(Ordering::Relaxed)),
            congestion_window: self.congestion_window.load(Ordering::Relaxed),
            pull_pressure: self.pull_pressure.load(Ordering::Relaxed),
        }
    }
}

/// Sender-side owner of a single exposure (§3 `ExposureSurface`).
#[derive(Debug)]
pub struct ExposureSurface {
    manifest: Manifest,
    source: Bytes,
    key: [u8; 32],
    bitmap: ChunkBitmap,
    hashes: Mutex<HashMap<u32, [u8; 32]>>,
    retries: Mutex<HashMap<u32, RetryState>>,
    stats: AtomicStats,
}

impl ExposureSurface {
    /// Allocate a surface over `source` (already chunk-contiguous bytes)
    /// described by `manifest`. `key` is the resolved per-chunk hash /
    /// cipher key (§4.5, `RgtConfig::reliability.resolved_key`).
    pub fn create(
        manifest: Manifest,
        source: Bytes,
        key: [u8; 32],
    ) -> Result<Self, SurfaceError> {
        if source.len() as u64 != manifest.total_size {
            return Err(SurfaceError::ResourceExhausted {
                chunk_count: manifest.chunk_count,
            });
        }
        Ok(Self {
            bitmap: ChunkBitmap::new(manifest.chunk_count as usize),
            manifest,
            source,
            key,
            hashes: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            stats: AtomicStats::default(),
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn bitmap(&self) -> &ChunkBitmap {
        &self.bitmap
    }

    /// Borrow the source bytes for chunk `index`, as defined by the
    /// manifest's fixed chunk size (last chunk may be shorter).
    pub fn chunk_bytes(&self, index: u32) -> Result<Bytes, SurfaceError> {
        if index >= self.manifest.chunk_count {
            return Err(SurfaceError::IndexOutOfRange {
                index,
                chunk_count: self.manifest.chunk_count,
            });
        }
        let start = index as u64 * self.manifest.chunk_size as u64;
        let len = self.manifest.chunk_len(index) as usize;
        Ok(self.source.slice(start as usize..start as usize + len))
    }

    /// Record chunk `index` as available, hashing it if integrity is on.
    /// Idempotent for identical bytes; `InvariantViolation` otherwise (P2).
    pub fn expose(&self, index: u32, bytes: &[u8]) -> Result<(), SurfaceError> {
        if index >= self.manifest.chunk_count {
            return Err(SurfaceError::IndexOutOfRange {
                index,
                chunk_count: self.manifest.chunk_count,
            });
        }

        if self.manifest.integrity_mode != IntegrityMode::None {
            let hash = rgt_core::crypto::chunk_hash(&self.key, index, bytes);
            let mut hashes = self.hashes.lock().expect("hashes mutex poisoned");
            match hashes.get(&index) {
                Some(existing) if *existing == hash => return Ok(()), // idempotent
                Some(_) => return Err(SurfaceError::InvariantViolation { index }),
                None => {
                    hashes.insert(index, hash);
                }
            }
        } else if self.bitmap.test(index as usize) {
            // No hash table to compare against; trust the bit as already set.
            return Ok(());
        }

        if self.bitmap.set(index as usize) {
            self.stats.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Record an ACK for `index`: bump the counter and clear retry state.
    pub fn mark_acked(&self, index: u32) {
        self.stats.acks_received.fetch_add(1, Ordering::Relaxed);
        self.retries.lock().expect("retries mutex poisoned").remove(&index);
    }

    /// Record a NACK for `index`: bump the counter and start tracking it for
    /// retry. `needs_retry` is **not** set here — per §4.5 step 3 it means
    /// "gave up after `retries > max_retries`", not "was NACKed".
    pub fn mark_nacked(&self, index: u32) {
        self.stats.nacks_received.fetch_add(1, Ordering::Relaxed);
        let mut retries = self.retries.lock().expect("retries mutex poisoned");
        retries.entry(index).or_default();
    }

    /// Retrieve a copy of the retry state for `index`, if any is tracked.
    pub fn retry_state(&self, index: u32) -> Option<RetryState> {
        self.retries.lock().expect("retries mutex poisoned").get(&index).copied()
    }

    /// Indices tracked for retry that haven't given up yet (§4.5 steps 1-2) —
    /// the backoff loop's input.
    pub fn indices_pending_retry(&self) -> Vec<u32> {
        self.retries
            .lock()
            .expect("retries mutex poisoned")
            .iter()
            .filter(|(_, state)| !state.needs_retry)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Indices that gave up after exceeding `max_retries` (§4.5 step 3) — the
    /// background recovery scan's input.
    pub fn indices_needing_retry(&self) -> Vec<u32> {
        self.retries
            .lock()
            .expect("retries mutex poisoned")
            .iter()
            .filter(|(_, state)| state.needs_retry)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Record a retransmission attempt for `index` at `now_ns`, returning
    /// the new retry count. Used by the reliable layer's backoff loop.
    pub fn record_retry_attempt(&self, index: u32, now_ns: u64) -> u32 {
        let mut retries = self.retries.lock().expect("retries mutex poisoned");
        let state = retries.entry(index).or_default();
        state.retries += 1;
        state.last_attempt_ns = now_ns;
        self.stats.retrans.fetch_add(1, Ordering::Relaxed);
        state.retries
    }

    /// Give up on `index` after it exceeds `max_retries` (§4.5 step 3).
    pub fn mark_failed(&self, index: u32) {
        let mut retries = self.retries.lock().expect("retries mutex poisoned");
        if let Some(state) = retries.get_mut(&index) {
            state.needs_retry = true;
        }
        self.stats.failed_chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the gave-up flag and reset the retry count after a chunk has
    /// been successfully re-verified and re-exposed by the recovery scan
    /// (§4.5 step 4 "attempts re-exposure with retries reset").
    pub fn clear_retry_flag(&self, index: u32) {
        if let Some(state) = self.retries.lock().expect("retries mutex poisoned").get_mut(&index) {
            state.needs_retry = false;
            state.retries = 0;
        }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Publish the latest rate-controller readings into the stats snapshot
    /// (§4.4 and §4.2 share these fields by design — the rate controller is
    /// the writer, the surface is the read side external callers see).
    pub fn record_rate_sample(&self, exposure_rate: f64, congestion_window: u32, pull_pressure: u64) {
        self.stats
            .exposure_rate_bits
            .store(exposure_rate.to_bits(), Ordering::Relaxed);
        self.stats.congestion_window.store(congestion_window, Ordering::Relaxed);
        self.stats.pull_pressure.store(pull_pressure, Ordering::Relaxed);
    }

    /// Lock-free read of the atomic counters (§4.2).
    pub fn snapshot_stats(&self) -> Stats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgt_core::manifest::CipherMode;

    fn surface(total: u64, chunk_size: u32, integrity: IntegrityMode) -> ExposureSurface {
        let manifest = Manifest::new(total, chunk_size, integrity, CipherMode::None);
        let source = Bytes::from(vec![0xab; total as usize]);
        ExposureSurface::create(manifest, source, [0u8; 32]).unwrap()
    }

    #[test]
    fn expose_sets_bit_and_counters() {
        let s = surface(10, 4, IntegrityMode::None);
        let bytes = s.chunk_bytes(0).unwrap();
        s.expose(0, &bytes).unwrap();
        assert!(s.bitmap().test(0));
        let stats = s.snapshot_stats();
        assert_eq!(stats.chunks_sent, 1);
        assert_eq!(stats.bytes_sent, 4);
    }

    #[test]
    fn expose_is_idempotent_for_identical_bytes() {
        let s = surface(10, 4, IntegrityMode::PerChunkHash);
        let bytes = s.chunk_bytes(0).unwrap();
        s.expose(0, &bytes).unwrap();
        s.expose(0, &bytes).unwrap();
        assert_eq!(s.snapshot_stats().chunks_sent, 1);
    }

    #[test]
    fn expose_rejects_differing_bytes_with_hashing_on() {
        let s = surface(10, 4, IntegrityMode::PerChunkHash);
        let bytes = s.chunk_bytes(0).unwrap();
        s.expose(0, &bytes).unwrap();
        let err = s.expose(0, b"diff").unwrap_err();
        assert_eq!(err, SurfaceError::InvariantViolation { index: 0 });
    }

    #[test]
    fn mark_acked_clears_retry_state() {
        let s = surface(10, 4, IntegrityMode::None);
        s.mark_nacked(0);
        assert!(s.retry_state(0).is_some());
        s.mark_acked(0);
        assert!(s.retry_state(0).is_none());
    }

    #[test]
    fn retry_attempts_increment_and_count_as_retrans() {
        let s = surface(10, 4, IntegrityMode::None);
        s.mark_nacked(2);
        let count = s.record_retry_attempt(2, 100);
        assert_eq!(count, 1);
        let count = s.record_retry_attempt(2, 200);
        assert_eq!(count, 2);
        assert_eq!(s.snapshot_stats().retrans, 2);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let s = surface(10, 4, IntegrityMode::None);
        let err = s.expose(100, b"x").unwrap_err();
        assert_eq!(
            err,
            SurfaceError::IndexOutOfRange { index: 100, chunk_count: 3 }
        );
    }
}
