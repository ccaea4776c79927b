//! Sender engine (C6) — §4.6's state machine over the exposure surface.
//!
//! Grounded on the reference daemon's `chunk::send_worker` + `chunk::manager`
//! pair (dequeue outstanding work, resolve a destination, send, all folded
//! into one task), with the send/receive split of `chunk::send.rs` /
//! `chunk::receive.rs` kept as the shape of `send_chunk_data` /
//! `handle_packet` below. Unlike the reference daemon this crate runs the
//! producer, emitter, and ACK/NACK ingestion activities of §5 on a single
//! `tokio::select!` loop rather than three separate tasks — permitted by §5
//! ("implementers may collapse (1)+(2) when the source is already chunked"
//! and "[Recovery] may run on the Emitter thread when idle"), and it keeps
//! the §5 ordering guarantee ("no CHUNK_DATA after the corresponding ACK is
//! processed") trivially true since both happen on the same task in order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use rgt_core::manifest::{CipherMode, ExposureId, IntegrityMode};
use rgt_core::wire::{self, flags, Packet, PacketType};
use rgt_core::RgtConfig;
use rgt_surface::{ChunkBitmap, ExposureStats, ExposureSurface, RateController, ReliablePolicy};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::error::SessionError;
use crate::session::handshake;
use crate::transport::Transport;

/// Why an index ended up in the demand queue — only `Nack` counts as a
/// retransmission when it's actually emitted (§4.5 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemandOrigin {
    Pull,
    Nack,
}

/// §4.6's sender state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Handshaking,
    Exposing,
    Completing,
    Done,
    Cancelled,
    Failed,
}

/// Runs one exposure surface's sender side: packet ingestion, paced
/// CHUNK_DATA emission, and the periodic recovery scan.
pub struct SenderEngine {
    exposure_id: ExposureId,
    surface: Arc<ExposureSurface>,
    transport: Transport,
    rate: Mutex<RateController>,
    reliable: ReliablePolicy,
    config: RgtConfig,
    key: [u8; 32],
    start: Instant,

    peers: DashSet<SocketAddr>,
    /// FIFO of (peer, index, origin) demand signals from PULL_REQUEST /
    /// CHUNK_NACK, drained in arrival order — the primary sender tie-break
    /// (§4.6).
    requested: Mutex<VecDeque<(SocketAddr, u32, DemandOrigin)>>,
    /// Last peer known to want each index, used to address retries (§4.5)
    /// that were not triggered by a fresh PULL_REQUEST/NACK.
    last_requester: Mutex<HashMap<u32, SocketAddr>>,
    /// Chunks the sender has seen ACKed, distinct from `surface`'s own
    /// presence bitmap (which tracks *produced*, not *acknowledged*, chunks)
    /// — needed for the Completing transition's "all outstanding chunks
    /// have been ACKed" condition (§4.6).
    acked: ChunkBitmap,
    /// Running total of PULL_REQUEST/CHUNK_NACK demand signals, published
    /// into `Stats::pull_pressure` (§4.2).
    pull_pressure_total: AtomicU64,

    state: Mutex<SenderState>,
    completing_deadline: Mutex<Option<Instant>>,
    cancel_requested: AtomicBool,
    done: Notify,
}

impl SenderEngine {
    pub fn new(
        exposure_id: ExposureId,
        surface: Arc<ExposureSurface>,
        transport: Transport,
        config: RgtConfig,
        key: [u8; 32],
    ) -> Arc<Self> {
        let chunk_count = surface.manifest().chunk_count as usize;
        let rate = RateController::new(
            config.network.initial_exposure_rate,
            config.network.rate_min,
            config.network.rate_max,
            Duration::from_millis(config.network.rate_tick_ms),
        );
        let reliable =
            ReliablePolicy::new(config.reliability.base_backoff_ns, config.reliability.max_retries);

        Arc::new(Self {
            exposure_id,
            surface,
            transport,
            rate: Mutex::new(rate),
            reliable,
            config,
            key,
            start: Instant::now(),
            peers: DashSet::new(),
            requested: Mutex::new(VecDeque::new()),
            last_requester: Mutex::new(HashMap::new()),
            acked: ChunkBitmap::new(chunk_count),
            pull_pressure_total: AtomicU64::new(0),
            state: Mutex::new(SenderState::Idle),
            completing_deadline: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    pub async fn state(&self) -> SenderState {
        *self.state.lock().await
    }

    pub fn snapshot_stats(&self) -> ExposureStats {
        self.surface.snapshot_stats()
    }

    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    /// Block until the session reaches a terminal state.
    pub async fn wait_done(&self) -> SenderState {
        loop {
            let state = self.state().await;
            if matches!(
                state,
                SenderState::Done | SenderState::Cancelled | SenderState::Failed
            ) {
                return state;
            }
            self.done.notified().await;
        }
    }

    /// Drive the state machine until cancellation or completion (§4.6).
    /// Pull mode waits passively for an EXPOSE_REQUEST; eager-push mode
    /// (§9) announces to `config.network.eager_push_peer` immediately.
    pub async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        *self.state.lock().await = SenderState::Handshaking;

        if self.config.reliability.eager_push {
            if let Some(peer) = self
                .config
                .network
                .resolved_eager_push_peer()
                .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?
            {
                self.push_to(peer).await?;
            }
        }

        let deadline = self.start + Duration::from_millis(self.config.reliability.session_deadline_ms);
        let mut recv_buf = vec![0u8; wire::MAX_PAYLOAD + wire::HEADER_SIZE];
        let mut recovery_interval =
            tokio::time::interval(Duration::from_millis(self.config.reliability.recovery_scan_interval_ms));

        loop {
            if self.cancel_requested.load(Ordering::SeqCst) {
                *self.state.lock().await = SenderState::Cancelled;
                info!(exposure_id = %self.exposure_id, "sender cancelled");
                self.done.notify_waiters();
                return Ok(());
            }
            if Instant::now() >= deadline && self.requested.lock().await.is_empty() {
                self.maybe_enter_completing().await?;
            }
            if self.state().await == SenderState::Done {
                return Ok(());
            }

            self.tick_rate().await;
            let poll_window = Duration::from_millis(5).min(self.rate_tick().await);
            tokio::select! {
                recv = self.transport.recv(&mut recv_buf, poll_window) => {
                    if let Some((len, from)) = recv? {
                        if let Err(e) = self.handle_datagram(&recv_buf[..len], from).await {
                            debug!(error = %e, "dropping malformed datagram");
                        }
                    }
                }
                _ = recovery_interval.tick() => {
                    self.run_recovery_scan().await?;
                }
                _ = tokio::time::sleep(poll_window) => {}
            }

            self.emit_ready_chunks().await?;
            self.maybe_enter_completing().await?;

            if self.completing_grace_elapsed().await {
                self.finish().await;
                return Ok(());
            }
        }
    }

    async fn rate_tick(&self) -> Duration {
        self.rate.lock().await.inter_send_interval()
    }

    /// Advance the rate controller and publish its reading into the
    /// surface's stats snapshot (§4.4/§4.2 share these fields by design).
    async fn tick_rate(&self) {
        let mut rate = self.rate.lock().await;
        rate.tick(Instant::now());
        self.surface.record_rate_sample(
            rate.exposure_rate(),
            rate.congestion_window(),
            self.pull_pressure_total.load(Ordering::Relaxed),
        );
    }

    /// Eager-push path (§9): address is already known, so skip waiting for
    /// EXPOSE_REQUEST — announce the manifest and register the peer.
    async fn push_to(&self, peer: SocketAddr) -> Result<(), SessionError> {
        handshake::send_manifest(&self.transport, peer, self.exposure_id, self.surface.manifest())
            .await?;
        self.peers.insert(peer);
        *self.state.lock().await = SenderState::Exposing;
        for index in self.surface.bitmap().set_indices_from(0) {
            let datagram =
                Packet::encode(self.exposure_id.0, PacketType::ChunkAvailable, index, 0, &[])?;
            self.transport.send_to(peer, &datagram).await?;
        }
        Ok(())
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Result<(), SessionError> {
        let packet = Packet::decode(datagram)?;
        if packet.exposure_id() != self.exposure_id.0 {
            // §7 UnknownSession: a sender replies CANCEL so a confused peer
            // stops retrying against the wrong exposure; the error still
            // propagates so the caller logs and drops the datagram.
            if let Ok(reply) = Packet::encode(packet.exposure_id(), PacketType::Cancel, 0, 0, &[]) {
                let _ = self.transport.send_to(from, &reply).await;
            }
            return Err(SessionError::UnknownSession { exposure_id: packet.exposure_id() });
        }

        match packet.packet_type() {
            PacketType::ExposeRequest => {
                self.peers.insert(from);
                handshake::send_manifest(&self.transport, from, self.exposure_id, self.surface.manifest())
                    .await?;
                let mut state = self.state.lock().await;
                if *state == SenderState::Handshaking {
                    *state = SenderState::Exposing;
                }
            }
            PacketType::PullRequest => {
                self.peers.insert(from);
                let indices = wire::decode_index_list(&packet.payload)?;
                let mut requested = self.requested.lock().await;
                let mut last = self.last_requester.lock().await;
                let mut rate = self.rate.lock().await;
                for index in indices {
                    requested.push_back((from, index, DemandOrigin::Pull));
                    last.insert(index, from);
                    rate.record_pull_pressure();
                    self.pull_pressure_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            PacketType::ChunkAck => {
                self.peers.insert(from);
                let acked_indices = decode_ack_payload(&packet)?;
                for index in acked_indices {
                    self.surface.mark_acked(index);
                    self.acked.set(index as usize);
                }
                // §4.6 "Completing → Done": any ACK while Completing closes
                // the session out immediately rather than waiting out the
                // grace window.
                if *self.state.lock().await == SenderState::Completing {
                    self.finish().await;
                }
            }
            PacketType::ChunkNack => {
                self.peers.insert(from);
                let indices = wire::decode_index_list(&packet.payload)?;
                let mut requested = self.requested.lock().await;
                let mut last = self.last_requester.lock().await;
                let mut rate = self.rate.lock().await;
                for index in indices {
                    self.surface.mark_nacked(index);
                    requested.push_back((from, index, DemandOrigin::Nack));
                    last.insert(index, from);
                    rate.record_pull_pressure();
                    self.pull_pressure_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            PacketType::Cancel => {
                self.cancel_requested.store(true, Ordering::SeqCst);
            }
            other => {
                trace!(?other, "sender dropping packet type not expected inbound");
            }
        }
        Ok(())
    }

    /// Emit one chunk per scheduling tick (§4.4), draining the demand queue
    /// in arrival order — the primary tie-break of §4.6. A NACK-originated
    /// entry is a retransmission (§4.5 step 2) the moment it's actually sent;
    /// a plain PULL_REQUEST entry is a first send and doesn't count.
    async fn emit_ready_chunks(&self) -> Result<(), SessionError> {
        let next = self.requested.lock().await.pop_front();
        let Some((peer, index, origin)) = next else { return Ok(()) };
        if !self.surface.bitmap().test(index as usize) {
            return Ok(()); // not yet produced — drop the stale request
        }
        if origin == DemandOrigin::Nack {
            let now_ns = self.start.elapsed().as_nanos() as u64;
            self.reliable.record_attempt(&self.surface, index, now_ns);
        }
        self.send_chunk_data(peer, index).await
    }

    async fn run_recovery_scan(&self) -> Result<(), SessionError> {
        self.reliable.recovery_scan(&self.surface)?;

        let now_ns = self.start.elapsed().as_nanos() as u64;
        let batch = self.reliable.due_for_retry(&self.surface, now_ns);
        let last_requester = self.last_requester.lock().await;
        for index in batch.ready {
            let Some(&peer) = last_requester.get(&index) else {
                continue; // no destination recorded yet — wait for a fresh request
            };
            self.reliable.record_attempt(&self.surface, index, now_ns);
            drop(last_requester);
            self.send_chunk_data(peer, index).await?;
            return Ok(()); // one retry per scan keeps this cooperative with the select loop
        }
        Ok(())
    }

    async fn send_chunk_data(&self, peer: SocketAddr, index: u32) -> Result<(), SessionError> {
        let mut bytes = self.surface.chunk_bytes(index)?.to_vec();
        let mut flag_bits = 0u8;

        let hash = if self.surface.manifest().integrity_mode != IntegrityMode::None {
            Some(rgt_core::crypto::chunk_hash(self.key(), index, &bytes))
        } else {
            None
        };

        if self.surface.manifest().cipher_mode == CipherMode::StreamXor {
            rgt_core::crypto::stream_xor(self.key(), self.exposure_id.0, index, &mut bytes);
            flag_bits |= flags::ENCRYPTED;
        }

        let mut payload = Vec::with_capacity(32 + bytes.len());
        if let Some(hash) = hash {
            payload.extend_from_slice(&hash);
            flag_bits |= flags::HAS_HASH;
        }
        payload.extend_from_slice(&bytes);

        let datagram = Packet::encode(self.exposure_id.0, PacketType::ChunkData, index, flag_bits, &payload)?;
        self.transport.send_to(peer, &datagram).await?;
        trace!(index, %peer, "chunk data sent");
        Ok(())
    }

    fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// §4.6 "Exposing → Completing": bitmap full, no outstanding demand, and
    /// every produced chunk ACKed — or the deadline has elapsed with no
    /// NACKs outstanding.
    async fn maybe_enter_completing(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if *state != SenderState::Exposing {
            return Ok(());
        }
        let bitmap_full = self.surface.bitmap().is_full();
        let all_acked = self.acked.popcount() == self.surface.manifest().chunk_count as usize;
        let no_outstanding = self.requested.lock().await.is_empty();
        if bitmap_full && all_acked && no_outstanding {
            *state = SenderState::Completing;
            drop(state);
            *self.completing_deadline.lock().await =
                Some(Instant::now() + Duration::from_millis(self.config.reliability.cancel_grace_ms));
            for peer in self.peers.iter() {
                let datagram = Packet::encode(self.exposure_id.0, PacketType::ExposureComplete, 0, 0, &[])?;
                self.transport.send_to(*peer, &datagram).await?;
            }
            info!(exposure_id = %self.exposure_id, "exposure complete, awaiting final ack");
        }
        Ok(())
    }

    /// §4.6 "Completing → Done": either a CHUNK_ACK arrived after Completing
    /// (any further ACK counts — the bitmap was already full) or the grace
    /// window elapsed.
    async fn completing_grace_elapsed(&self) -> bool {
        let deadline = *self.completing_deadline.lock().await;
        matches!(deadline, Some(d) if Instant::now() >= d)
    }

    async fn finish(&self) {
        *self.state.lock().await = SenderState::Done;
        self.done.notify_waiters();
        info!(exposure_id = %self.exposure_id, "sender done");
    }
}

/// Decode a CHUNK_ACK payload in whichever encoding the sender used (§9 "ACK
/// payload format" — both encodings are always accepted).
fn decode_ack_payload(packet: &Packet) -> Result<Vec<u32>, SessionError> {
    if packet.header.flags & flags::ACK_BITMAP_DELTA != 0 {
        let (from_index, words) = wire::decode_bitmap_delta(&packet.payload)?;
        let mut indices = Vec::new();
        for (word_offset, word) in words.iter().enumerate() {
            for bit in 0..64 {
                if word & (1u64 << bit) != 0 {
                    indices.push(from_index + (word_offset as u32) * 64 + bit as u32);
                }
            }
        }
        Ok(indices)
    } else {
        Ok(wire::decode_index_list(&packet.payload)?)
    }
}
