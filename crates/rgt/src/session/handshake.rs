//! Handshake primitives shared by the sender and receiver engines (§4.6/§4.7
//! `Idle`/`WaitingManifest` transitions).
//!
//! §4.3's packet table lists EXPOSE_REQUEST as S→R, but §4.7 has the
//! receiver send it when calling `pull()`; the spec itself flags this as
//! unresolved. This crate resolves it as: the receiver always sends
//! EXPOSE_REQUEST to initiate a pull (§4.7's reading), and a sender only
//! ever sends EXPOSE_MANIFEST unsolicited when `eager_push` is configured
//! (§9 "push vs pull", decided in `DESIGN.md`). Both directions share the
//! same framing helpers here so the two engines never hand-roll packet
//! construction differently.

use std::net::SocketAddr;
use std::time::Duration;

use rgt_core::manifest::{ExposureId, Manifest};
use rgt_core::wire::{Packet, PacketType};

use crate::error::SessionError;
use crate::transport::Transport;

/// Send EXPOSE_REQUEST for `exposure_id` to `peer` (§4.7: receiver's
/// `pull()` entry point).
pub async fn send_expose_request(
    transport: &Transport,
    peer: SocketAddr,
    exposure_id: ExposureId,
) -> Result<(), SessionError> {
    let datagram = Packet::encode(exposure_id.0, PacketType::ExposeRequest, 0, 0, &[])?;
    transport.send_to(peer, &datagram).await
}

/// Send EXPOSE_MANIFEST for `exposure_id` to `peer` (§4.6: reply to an
/// EXPOSE_REQUEST, or the eager-push unsolicited announcement).
pub async fn send_manifest(
    transport: &Transport,
    peer: SocketAddr,
    exposure_id: ExposureId,
    manifest: &Manifest,
) -> Result<(), SessionError> {
    let payload = manifest.encode();
    let datagram = Packet::encode(exposure_id.0, PacketType::ExposeManifest, 0, 0, &payload)?;
    transport.send_to(peer, &datagram).await
}

/// Receiver-side handshake: send EXPOSE_REQUEST, then block (up to
/// `handshake_timeout`) for the matching EXPOSE_MANIFEST. Any datagram for a
/// different `exposure_id`, or one that fails to parse, is dropped and the
/// wait continues — this mirrors §4.3's "drop and continue" malformed
/// packet policy rather than failing the whole handshake on unrelated
/// traffic sharing the socket.
pub async fn receiver_handshake(
    transport: &Transport,
    peer: SocketAddr,
    exposure_id: ExposureId,
    handshake_timeout: Duration,
) -> Result<Manifest, SessionError> {
    send_expose_request(transport, peer, exposure_id).await?;

    let deadline = tokio::time::Instant::now() + handshake_timeout;
    let mut buf = vec![0u8; rgt_core::wire::MAX_PAYLOAD + rgt_core::wire::HEADER_SIZE];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(SessionError::Timeout(format!(
                "no EXPOSE_MANIFEST for exposure {exposure_id} within {handshake_timeout:?}"
            )));
        }

        let Some((len, from)) = transport.recv(&mut buf, remaining).await? else {
            continue;
        };
        if from != peer {
            continue;
        }
        let Ok(packet) = Packet::decode(&buf[..len]) else {
            continue;
        };
        if packet.exposure_id() != exposure_id.0 || packet.packet_type() != PacketType::ExposeManifest
        {
            continue;
        }
        return Ok(Manifest::decode(&packet.payload)?);
    }
}
