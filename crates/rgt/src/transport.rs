//! Transport adapter (C9) — a thin shim over a UDP datagram socket.
//!
//! Grounded on the reference daemon's chunk send/receive loops: a single
//! `tokio::net::UdpSocket` wrapped in an `Arc`, with `socket2` used only to
//! size the kernel send/receive buffers before handing the socket to tokio
//! (the same split the reference daemon uses — `socket2` builds and tunes
//! the raw socket, tokio drives it async).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Minimum kernel socket buffer size requested at bind time (§4.9: "≥ 2 MiB").
const MIN_SOCKET_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// A bound UDP endpoint used by exactly one session (§5: "single-writer-
/// single-reader per session").
#[derive(Debug, Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    /// Bind to `bind_address:port` (`port = 0` for an ephemeral port),
    /// requesting generous kernel buffers. Falls back silently if the
    /// platform refuses the buffer-size request — RGT degrades to smaller
    /// buffers rather than failing to start (§4.9).
    pub async fn bind(bind_address: &str, port: u16) -> Result<Self, SessionError> {
        let addr: SocketAddr = format!("{bind_address}:{port}")
            .parse()
            .map_err(|e| SessionError::ResourceExhausted(format!("invalid bind address: {e}")))?;

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(SessionError::from)?;
        socket.set_nonblocking(true).map_err(SessionError::from)?;

        if let Err(e) = socket.set_recv_buffer_size(MIN_SOCKET_BUFFER_BYTES) {
            warn!(error = %e, "failed to grow receive buffer, continuing with default");
        }
        if let Err(e) = socket.set_send_buffer_size(MIN_SOCKET_BUFFER_BYTES) {
            warn!(error = %e, "failed to grow send buffer, continuing with default");
        }

        socket.bind(&addr.into()).map_err(SessionError::from)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(SessionError::from)?;
        debug!(local_addr = ?socket.local_addr().ok(), "transport bound");

        Ok(Self { socket: Arc::new(socket) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        self.socket.local_addr().map_err(SessionError::from)
    }

    /// Send a single datagram. RGT frames one logical packet per datagram
    /// (§6), so this never needs to fragment at this layer.
    pub async fn send_to(&self, peer: SocketAddr, datagram: &[u8]) -> Result<(), SessionError> {
        self.socket.send_to(datagram, peer).await.map(|_| ()).map_err(SessionError::from)
    }

    /// Receive one datagram, or `None` on timeout.
    pub async fn recv(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SessionError> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(e)) => Err(SessionError::from(e)),
            Err(_elapsed) => Ok(None),
        }
    }

    /// No explicit close call is needed — dropping the last `Arc` closes the
    /// underlying socket — but this is kept as an explicit, documented
    /// operation to match the transport adapter's public contract (§4.9).
    pub fn close(self) {
        drop(self.socket);
    }
}
