//! Receiver engine (C7) — §4.7's state machine over the receive surface.
//!
//! Grounded on the reference daemon's `chunk::receive.rs` /
//! `chunk::recovery.rs` pair: ingest datagrams into a reassembly store,
//! periodically emit acks for newly-arrived ranges, and periodically NACK
//! anything that has been missing longer than the stall threshold. As with
//! `SenderEngine`, the Ingestion/ACK-emission/NACK-emission activities of §5
//! collapse onto one `tokio::select!` loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rgt_core::manifest::ExposureId;
use rgt_core::wire::{self, Packet, PacketType};
use rgt_core::RgtConfig;
use rgt_surface::{ReceiveStats, ReceiveSurface};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace};

use crate::error::SessionError;
use crate::session::handshake;
use crate::transport::Transport;

/// §4.7's receiver state machine. `Idle`/`WaitingManifest` are folded into
/// [`ReceiverEngine::connect`]'s handshake — by the time an engine exists it
/// is already past them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Receiving,
    Draining,
    Done,
    Cancelled,
    Failed,
}

/// Runs one exposure's receiver side against a single known sender address.
pub struct ReceiverEngine {
    exposure_id: ExposureId,
    peer: SocketAddr,
    transport: Transport,
    surface: ReceiveSurface,
    config: RgtConfig,
    key: [u8; 32],

    state: Mutex<ReceiverState>,
    cancel_requested: AtomicBool,
    done: Notify,
}

impl ReceiverEngine {
    /// Pull-mode entry point (§4.7 `pull()`): perform the handshake against
    /// `peer`, then build the receive surface from the returned manifest.
    pub async fn connect(
        transport: Transport,
        peer: SocketAddr,
        exposure_id: ExposureId,
        config: RgtConfig,
        key: [u8; 32],
    ) -> Result<Arc<Self>, SessionError> {
        let manifest = handshake::receiver_handshake(
            &transport,
            peer,
            exposure_id,
            Duration::from_millis(config.reliability.handshake_timeout_ms),
        )
        .await?;
        let surface = ReceiveSurface::create(manifest, key);
        info!(%exposure_id, chunk_count = manifest.chunk_count, "handshake complete");

        Ok(Arc::new(Self {
            exposure_id,
            peer,
            transport,
            surface,
            config,
            key,
            state: Mutex::new(ReceiverState::Receiving),
            cancel_requested: AtomicBool::new(false),
            done: Notify::new(),
        }))
    }

    /// Eager-push entry point (§9): wait passively for an unsolicited
    /// EXPOSE_MANIFEST from `peer` instead of requesting one.
    pub async fn accept_pushed(
        transport: Transport,
        peer: SocketAddr,
        exposure_id: ExposureId,
        config: RgtConfig,
        key: [u8; 32],
    ) -> Result<Arc<Self>, SessionError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(config.reliability.handshake_timeout_ms);
        let mut buf = vec![0u8; wire::MAX_PAYLOAD + wire::HEADER_SIZE];
        let manifest = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout(format!(
                    "no pushed EXPOSE_MANIFEST for exposure {exposure_id} within handshake window"
                )));
            }
            let Some((len, from)) = transport.recv(&mut buf, remaining).await? else { continue };
            if from != peer {
                continue;
            }
            let Ok(packet) = Packet::decode(&buf[..len]) else { continue };
            if packet.exposure_id() != exposure_id.0 || packet.packet_type() != PacketType::ExposeManifest {
                continue;
            }
            break rgt_core::manifest::Manifest::decode(&packet.payload)?;
        };

        let surface = ReceiveSurface::create(manifest, key);
        Ok(Arc::new(Self {
            exposure_id,
            peer,
            transport,
            surface,
            config,
            key,
            state: Mutex::new(ReceiverState::Receiving),
            cancel_requested: AtomicBool::new(false),
            done: Notify::new(),
        }))
    }

    pub async fn state(&self) -> ReceiverState {
        *self.state.lock().await
    }

    pub fn progress(&self) -> f32 {
        self.surface.progress()
    }

    pub fn snapshot_stats(&self) -> ReceiveStats {
        self.surface.snapshot_stats()
    }

    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
    }

    pub async fn wait_done(&self) -> ReceiverState {
        loop {
            let state = self.state().await;
            if matches!(
                state,
                ReceiverState::Done | ReceiverState::Cancelled | ReceiverState::Failed
            ) {
                return state;
            }
            self.done.notified().await;
        }
    }

    /// Reassemble the full object once [`ReceiverState::Done`] — `None` if
    /// called before completion or after the chunks have already been taken.
    pub fn take_completed(&self) -> Option<Bytes> {
        if !self.surface.is_complete() {
            return None;
        }
        let manifest = self.surface.manifest();
        let mut out = BytesMut::with_capacity(manifest.total_size as usize);
        for index in 0..manifest.chunk_count {
            out.extend_from_slice(&self.surface.take_chunk(index)?);
        }
        Some(out.freeze())
    }

    /// Drive the state machine until cancellation or completion (§4.7).
    pub async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        self.request_all_missing().await?;

        if self.surface.is_complete() {
            return self.drain_and_finish().await;
        }

        let ack_period = Duration::from_millis(self.config.reliability.ack_interval_ms);
        let nack_threshold = Duration::from_millis(self.config.reliability.nack_threshold_ms);
        let mut ack_interval = tokio::time::interval(ack_period);
        let mut recv_buf = vec![0u8; wire::MAX_PAYLOAD + wire::HEADER_SIZE];

        loop {
            if self.cancel_requested.load(Ordering::SeqCst) {
                *self.state.lock().await = ReceiverState::Cancelled;
                self.send_best_effort_cancel().await;
                info!(exposure_id = %self.exposure_id, "receiver cancelled");
                self.done.notify_waiters();
                return Ok(());
            }

            tokio::select! {
                recv = self.transport.recv(&mut recv_buf, ack_period) => {
                    if let Some((len, from)) = recv? {
                        if from != self.peer {
                            continue;
                        }
                        if let Err(e) = self.handle_datagram(&recv_buf[..len]).await {
                            debug!(error = %e, "dropping malformed datagram");
                        }
                    }
                }
                _ = ack_interval.tick() => {
                    self.send_ack().await?;
                    self.send_nacks(nack_threshold).await?;
                }
            }

            if self.surface.is_complete() {
                return self.drain_and_finish().await;
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8]) -> Result<(), SessionError> {
        let packet = Packet::decode(datagram)?;
        if packet.exposure_id() != self.exposure_id.0 {
            return Err(SessionError::UnknownSession { exposure_id: packet.exposure_id() });
        }

        match packet.packet_type() {
            PacketType::ChunkData => {
                let index = packet.sequence();
                let encrypted = packet.header.flags & wire::flags::ENCRYPTED != 0;
                let has_hash = packet.header.flags & wire::flags::HAS_HASH != 0;

                let mut payload = packet.payload.clone();
                let claimed_hash = if has_hash {
                    if payload.len() < 32 {
                        return Err(SessionError::MalformedPacket("chunk hash truncated".into()));
                    }
                    let hash: [u8; 32] = payload[..32].try_into().expect("checked length");
                    payload.drain(..32);
                    Some(hash)
                } else {
                    None
                };

                if encrypted {
                    rgt_core::crypto::stream_xor(&self.key, self.exposure_id.0, index, &mut payload);
                }

                let accepted = self
                    .surface
                    .receive_chunk(index, Bytes::from(payload), claimed_hash.as_ref())?;
                trace!(index, accepted, "chunk data received");
            }
            PacketType::ExposureComplete => {
                trace!("sender signalled exposure complete");
            }
            PacketType::Cancel => {
                self.cancel_requested.store(true, Ordering::SeqCst);
            }
            other => {
                trace!(?other, "receiver dropping packet type not expected inbound");
            }
        }
        Ok(())
    }

    /// Request every missing index up front (§4.7: the receiver drives pull
    /// pressure). Batched so a large object doesn't overflow one datagram.
    async fn request_all_missing(&self) -> Result<(), SessionError> {
        let missing = self.surface.bitmap().unset_indices();
        const INDICES_PER_BATCH: usize = 4096;
        for batch in missing.chunks(INDICES_PER_BATCH) {
            let payload = wire::encode_index_list(batch);
            let datagram = Packet::encode(self.exposure_id.0, PacketType::PullRequest, 0, 0, &payload)?;
            self.transport.send_to(self.peer, &datagram).await?;
        }
        Ok(())
    }

    async fn send_ack(&self) -> Result<(), SessionError> {
        let acked = self.surface.newly_set_since(0);
        if acked.is_empty() {
            return Ok(());
        }
        let payload = wire::encode_index_list(&acked);
        let datagram = Packet::encode(self.exposure_id.0, PacketType::ChunkAck, 0, 0, &payload)?;
        self.transport.send_to(self.peer, &datagram).await
    }

    async fn send_nacks(&self, nack_threshold: Duration) -> Result<(), SessionError> {
        let stalled = self.surface.stalled_missing(tokio::time::Instant::now().into_std(), nack_threshold);
        if stalled.is_empty() {
            return Ok(());
        }
        self.surface.record_loss_sample(true);
        let payload = wire::encode_index_list(&stalled);
        let datagram = Packet::encode(self.exposure_id.0, PacketType::ChunkNack, 0, 0, &payload)?;
        self.transport.send_to(self.peer, &datagram).await
    }

    async fn send_best_effort_cancel(&self) {
        if let Ok(datagram) = Packet::encode(self.exposure_id.0, PacketType::Cancel, 0, 0, &[]) {
            let _ = self.transport.send_to(self.peer, &datagram).await;
        }
    }

    /// §4.7 "Receiving → Draining → Done": send a final ack covering
    /// whatever the sender hasn't seen yet, then finish.
    async fn drain_and_finish(&self) -> Result<(), SessionError> {
        *self.state.lock().await = ReceiverState::Draining;
        self.send_ack().await?;
        *self.state.lock().await = ReceiverState::Done;
        info!(exposure_id = %self.exposure_id, "receiver done");
        self.done.notify_waiters();
        Ok(())
    }
}
