//! `ReceiveSurface` (C7 data side) — receiver-side indexed chunk store.
//!
//! Grounded directly on the reference daemon's `FileReassembler`: a
//! hash-map-keyed chunk store, a bitmap of what has arrived, and a
//! stall-detection pass that tracks how long each still-missing index has
//! been outstanding so NACKs aren't sent for chunks that simply haven't had
//! time to arrive yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rgt_core::manifest::{IntegrityMode, Manifest};

use crate::bitmap::ChunkBitmap;
use crate::error::SurfaceError;

/// Lock-free snapshot of a receive surface's counters (§3 `ReceiveSurface`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub rtt_estimate_ns: u64,
    pub loss_rate: f64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
    rtt_estimate_ns: AtomicU64,
    loss_rate_bits: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> Stats {
        Stats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            rtt_estimate_ns: self.rtt_estimate_ns.load(Ordering::Relaxed),
            loss_rate: f64::from_bits(self.loss_rate_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Receiver-side owner of an exposure's incoming chunk data (§3).
#[derive(Debug)]
pub struct ReceiveSurface {
    manifest: Manifest,
    key: [u8; 32],
    bitmap: ChunkBitmap,
    chunks: Mutex<HashMap<u32, Bytes>>,
    first_missing_seen: Mutex<HashMap<u32, Instant>>,
    stats: AtomicStats,
}

impl ReceiveSurface {
    /// Allocate a receive surface once the manifest has been received
    /// during handshake (§4.7 `WaitingManifest → Receiving`).
    pub fn create(manifest: Manifest, key: [u8; 32]) -> Self {
        Self {
            bitmap: ChunkBitmap::new(manifest.chunk_count as usize),
            manifest,
            key,
            chunks: Mutex::new(HashMap::new()),
            first_missing_seen: Mutex::new(HashMap::new()),
            stats: AtomicStats::default(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn bitmap(&self) -> &ChunkBitmap {
        &self.bitmap
    }

    /// Store an incoming chunk. Verifies the optional per-chunk hash first;
    /// drops (returns `Ok(false)`) on mismatch or if the bit is already set
    /// (§4.7: "if valid and bit is unset, store bytes ... otherwise drop").
    pub fn receive_chunk(
        &self,
        index: u32,
        bytes: Bytes,
        claimed_hash: Option<&[u8; 32]>,
    ) -> Result<bool, SurfaceError> {
        if index >= self.manifest.chunk_count {
            return Err(SurfaceError::IndexOutOfRange {
                index,
                chunk_count: self.manifest.chunk_count,
            });
        }
        if self.bitmap.test(index as usize) {
            return Ok(false);
        }

        if self.manifest.integrity_mode != IntegrityMode::None {
            let Some(claimed) = claimed_hash else {
                return Ok(false); // no hash where one was required — drop (I5)
            };
            if !rgt_core::crypto::verify_chunk_hash(&self.key, index, &bytes, claimed) {
                return Ok(false);
            }
        }

        let expected_len = self.manifest.chunk_len(index) as usize;
        if bytes.len() != expected_len {
            return Ok(false);
        }

        self.chunks.lock().expect("chunks mutex poisoned").insert(index, bytes.clone());
        if self.bitmap.set(index as usize) {
            self.stats.bytes_received.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
            self.first_missing_seen.lock().expect("timestamps mutex poisoned").remove(&index);
        }
        Ok(true)
    }

    /// Hand chunk `index` to the consumer, freeing its storage (Lifecycle:
    /// "freed when its bytes are handed to the consumer").
    pub fn take_chunk(&self, index: u32) -> Option<Bytes> {
        self.chunks.lock().expect("chunks mutex poisoned").remove(&index)
    }

    /// Fraction of chunks received so far (§4.7 `progress()`).
    pub fn progress(&self) -> f32 {
        if self.manifest.chunk_count == 0 {
            return 1.0;
        }
        self.bitmap.popcount() as f32 / self.manifest.chunk_count as f32
    }

    /// Indices currently missing, for CHUNK_NACK synthesis, filtered to
    /// those first observed missing at least `nack_threshold` ago — mirrors
    /// the reference daemon's stall-detection pass over `FileAssembly`.
    pub fn stalled_missing(&self, now: Instant, nack_threshold: Duration) -> Vec<u32> {
        let missing = self.bitmap.unset_indices();
        let mut seen = self.first_missing_seen.lock().expect("timestamps mutex poisoned");

        let mut stalled = Vec::new();
        for &index in &missing {
            let first_seen = *seen.entry(index).or_insert(now);
            if now.duration_since(first_seen) >= nack_threshold {
                stalled.push(index);
            }
        }
        // Drop tracking entries for indices that arrived since the last scan.
        seen.retain(|index, _| missing.contains(index));
        stalled
    }

    /// Indices set since `from` (exclusive lower bound on index, not time) —
    /// used to synthesize the index-list CHUNK_ACK encoding.
    pub fn newly_set_since(&self, from: u32) -> Vec<u32> {
        self.bitmap.set_indices_from(from as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_full()
    }

    pub fn record_rtt_sample(&self, sample_ns: u64) {
        // Simple EWMA, alpha = 1/8, matching common RTT-estimator practice.
        let previous = self.stats.rtt_estimate_ns.load(Ordering::Relaxed);
        let updated = if previous == 0 {
            sample_ns
        } else {
            previous - (previous / 8) + (sample_ns / 8)
        };
        self.stats.rtt_estimate_ns.store(updated, Ordering::Relaxed);
    }

    pub fn record_loss_sample(&self, was_lost: bool) {
        let previous = f64::from_bits(self.stats.loss_rate_bits.load(Ordering::Relaxed));
        let sample = if was_lost { 1.0 } else { 0.0 };
        let updated = previous * 0.875 + sample * 0.125;
        self.stats.loss_rate_bits.store(updated.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot_stats(&self) -> Stats {
        self.stats.snapshot()
    }
}
