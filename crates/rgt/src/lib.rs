//! Red Giant Transport (RGT) — a layer-4 bulk data-transfer protocol built
//! around an exposure-based pull model: a sender publishes bitmap-tracked
//! chunks on an exposure surface, receivers pull independently, and pull
//! pressure drives the sender's rate rather than a traditional per-receiver
//! congestion window (§1, §2).
//!
//! This crate is the handle layer (§6): [`SessionHandle`] wraps a sender's
//! [`session::SenderEngine`] and [`ClientHandle`] wraps a receiver's
//! [`session::ReceiverEngine`], each driving its engine on a background
//! task. `rgt-core` owns the wire format, manifest, crypto, and config;
//! `rgt-surface` owns the bitmap, exposure/receive surfaces, rate
//! controller, and reliable layer.

pub mod error;
pub mod session;
pub mod transport;

pub use error::SessionError;
pub use session::{ReceiverEngine, ReceiverState, SenderEngine, SenderState};
pub use transport::Transport;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rgt_core::{ExposureId, Manifest, RgtConfig};
use rgt_surface::{ExposureStats, ExposureSurface, ReceiveStats};
use tokio::task::JoinHandle;

/// Progress/error sink a caller can attach to a session or client (§9
/// "callback-based progress/error reporting"). Both methods have empty
/// default bodies so a caller only overrides what it cares about.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, _bytes_done: u64, _bytes_total: u64) {}
    fn on_error(&self, _message: &str) {}
}

/// The default sink when a caller doesn't supply one.
pub struct NullSink;

impl ProgressSink for NullSink {}

/// Chunk-at-a-time source for `expose_stream` (§6): an alternative to
/// handing `expose_bytes` a single already-materialised buffer, for
/// callers that produce the object incrementally (a file read in pieces,
/// a generator). The surface still needs `total_size` up front to compute
/// `chunk_count` at handshake time (§3 Manifest is immutable once built),
/// so streaming here means "don't require the caller to have assembled
/// one contiguous buffer themselves" rather than "start exposing before
/// the whole object exists".
pub trait ChunkProducer: Send {
    fn total_size(&self) -> u64;
    /// Return exactly `len` bytes for chunk `index`, in increasing index
    /// order starting at 0.
    fn next_chunk(&mut self, index: u32, len: usize) -> std::io::Result<Bytes>;
}

/// Sender-side handle (§6 `create_session`): owns one exposure surface and
/// the background task driving its [`SenderEngine`].
pub struct SessionHandle {
    exposure_id: ExposureId,
    engine: Arc<SenderEngine>,
    task: JoinHandle<Result<(), SessionError>>,
    local_addr: SocketAddr,
}

impl SessionHandle {
    /// Expose `data` as a new surface and start serving it. Binds a fresh
    /// transport per `config.network`; in pull mode the returned handle's
    /// `exposure_id`/`local_addr` are what a receiver needs to `pull()`.
    pub async fn expose_bytes(config: RgtConfig, data: Bytes) -> Result<Self, SessionError> {
        Self::expose_bytes_with_sink(config, data, Arc::new(NullSink)).await
    }

    pub async fn expose_bytes_with_sink(
        config: RgtConfig,
        data: Bytes,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, SessionError> {
        let key = config
            .reliability
            .resolved_key()
            .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?;
        let integrity_mode = config
            .reliability
            .resolved_integrity_mode()
            .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?;
        let cipher_mode = config
            .reliability
            .resolved_cipher_mode()
            .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?;

        let chunk_size = config.network.derive_chunk_size(data.len() as u64);
        let manifest = Manifest::new(data.len() as u64, chunk_size, integrity_mode, cipher_mode);
        let total_size = manifest.total_size;

        let surface = Arc::new(ExposureSurface::create(manifest, data, key)?);
        // §4.6 "Idle → Handshaking" collapses with production here since the
        // whole object is already in memory — every chunk is exposed
        // up front rather than incrementally (§5 permits this collapse).
        for index in 0..manifest.chunk_count {
            let bytes = surface.chunk_bytes(index)?;
            surface.expose(index, &bytes)?;
        }

        let transport = Transport::bind(&config.network.bind_address, config.network.port).await?;
        let local_addr = transport.local_addr()?;
        let exposure_id = ExposureId::generate();
        let engine = SenderEngine::new(exposure_id, surface, transport, config, key);

        let task_engine = engine.clone();
        let task = tokio::spawn(async move {
            let result = task_engine.run().await;
            if let Err(e) = &result {
                sink.on_error(&e.to_string());
            } else {
                sink.on_progress(total_size, total_size);
            }
            result
        });

        Ok(Self { exposure_id, engine, task, local_addr })
    }

    /// Expose an object produced chunk-at-a-time (§6 `expose_stream`):
    /// drain `producer` into a contiguous buffer sized to its declared
    /// `total_size`, then proceed exactly as [`Self::expose_bytes`].
    pub async fn expose_stream(
        config: RgtConfig,
        producer: Box<dyn ChunkProducer>,
    ) -> Result<Self, SessionError> {
        Self::expose_stream_with_sink(config, producer, Arc::new(NullSink)).await
    }

    pub async fn expose_stream_with_sink(
        config: RgtConfig,
        mut producer: Box<dyn ChunkProducer>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, SessionError> {
        let total_size = producer.total_size();
        let chunk_size = config.network.derive_chunk_size(total_size) as u64;

        let mut buf = BytesMut::with_capacity(total_size as usize);
        let mut index: u32 = 0;
        let mut remaining = total_size;
        while remaining > 0 {
            let len = remaining.min(chunk_size) as usize;
            let bytes = producer
                .next_chunk(index, len)
                .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?;
            if bytes.len() != len {
                return Err(SessionError::ResourceExhausted(format!(
                    "producer returned {} bytes for chunk {index}, expected {len}",
                    bytes.len()
                )));
            }
            buf.extend_from_slice(&bytes);
            remaining -= len as u64;
            index += 1;
        }

        Self::expose_bytes_with_sink(config, buf.freeze(), sink).await
    }

    pub fn exposure_id(&self) -> ExposureId {
        self.exposure_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn snapshot_stats(&self) -> ExposureStats {
        self.engine.snapshot_stats()
    }

    pub fn cancel(&self) {
        self.engine.cancel();
    }

    pub async fn wait_complete(&self) -> SenderState {
        self.engine.wait_done().await
    }

    /// Cancel and wait for the background task to exit.
    pub async fn destroy(self) -> Result<(), SessionError> {
        self.engine.cancel();
        self.task.await.map_err(|e| SessionError::ResourceExhausted(e.to_string()))?
    }
}

/// Receiver-side handle (§6 `create_client`): owns one receive surface and
/// the background task driving its [`ReceiverEngine`].
pub struct ClientHandle {
    engine: Arc<ReceiverEngine>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl ClientHandle {
    /// Pull `exposure_id` from `peer` (§4.7 `pull()`): bind a transport,
    /// handshake, and start draining chunks in the background.
    pub async fn pull(
        config: RgtConfig,
        peer: SocketAddr,
        exposure_id: ExposureId,
    ) -> Result<Self, SessionError> {
        Self::pull_with_sink(config, peer, exposure_id, Arc::new(NullSink)).await
    }

    pub async fn pull_with_sink(
        config: RgtConfig,
        peer: SocketAddr,
        exposure_id: ExposureId,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, SessionError> {
        let key = config
            .reliability
            .resolved_key()
            .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?;
        let transport = Transport::bind(&config.network.bind_address, config.network.port).await?;
        let engine = ReceiverEngine::connect(transport, peer, exposure_id, config, key).await?;

        let task_engine = engine.clone();
        let stats_engine = engine.clone();
        let task = tokio::spawn(async move {
            let result = task_engine.run().await;
            match &result {
                Ok(()) => {
                    let bytes = stats_engine.snapshot_stats().bytes_received;
                    sink.on_progress(bytes, bytes);
                }
                Err(e) => sink.on_error(&e.to_string()),
            }
            result
        });

        Ok(Self { engine, task })
    }

    /// Accept an eager-pushed exposure (§9 "push vs pull") instead of
    /// requesting one: wait for `peer` to announce `exposure_id`
    /// unsolicited rather than sending EXPOSE_REQUEST first. Only useful
    /// against a sender configured with `reliability.eager_push = true`.
    pub async fn accept(
        config: RgtConfig,
        peer: SocketAddr,
        exposure_id: ExposureId,
    ) -> Result<Self, SessionError> {
        Self::accept_with_sink(config, peer, exposure_id, Arc::new(NullSink)).await
    }

    pub async fn accept_with_sink(
        config: RgtConfig,
        peer: SocketAddr,
        exposure_id: ExposureId,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, SessionError> {
        let key = config
            .reliability
            .resolved_key()
            .map_err(|e| SessionError::ResourceExhausted(e.to_string()))?;
        let transport = Transport::bind(&config.network.bind_address, config.network.port).await?;
        let engine = ReceiverEngine::accept_pushed(transport, peer, exposure_id, config, key).await?;

        let task_engine = engine.clone();
        let stats_engine = engine.clone();
        let task = tokio::spawn(async move {
            let result = task_engine.run().await;
            match &result {
                Ok(()) => {
                    let bytes = stats_engine.snapshot_stats().bytes_received;
                    sink.on_progress(bytes, bytes);
                }
                Err(e) => sink.on_error(&e.to_string()),
            }
            result
        });

        Ok(Self { engine, task })
    }

    pub fn progress(&self) -> f32 {
        self.engine.progress()
    }

    pub fn snapshot_stats(&self) -> ReceiveStats {
        self.engine.snapshot_stats()
    }

    pub fn cancel(&self) {
        self.engine.cancel();
    }

    pub async fn wait_complete(&self) -> ReceiverState {
        self.engine.wait_done().await
    }

    /// Cancel (if still running), wait for the background task, and return
    /// the reassembled object if the transfer completed.
    pub async fn destroy(self) -> Result<Option<Bytes>, SessionError> {
        self.task.await.map_err(|e| SessionError::ResourceExhausted(e.to_string()))??;
        Ok(self.engine.take_completed())
    }
}
