//! RGT integration test harness — end-to-end scenarios (§8 E1–E6).
//!
//! The reference daemon's integration suite drives real network namespaces
//! with `tc qdisc` fault injection (see its `tests/integration/fault.rs`).
//! RGT's core has no daemon process to spawn and no privileged netns setup —
//! it's a library — so fault injection here is an in-process UDP relay that
//! sits between a real sender and a real receiver and selectively drops or
//! tampers datagrams before forwarding them. Everything else runs the public
//! handle API (`SessionHandle`/`ClientHandle`) exactly as an external
//! collaborator would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rgt::session::{handshake, ReceiverEngine, ReceiverState, SenderEngine, SenderState};
use rgt::transport::Transport;
use rgt::{ClientHandle, SessionHandle};
use rgt_core::manifest::{CipherMode, ExposureId, IntegrityMode};
use rgt_core::wire::{self, Packet, PacketType};
use rgt_core::{Manifest, RgtConfig};
use rgt_surface::ExposureSurface;

fn loopback_config() -> RgtConfig {
    let mut config = RgtConfig::default();
    config.network.bind_address = "127.0.0.1".to_string();
    config.reliability.ack_interval_ms = 30;
    config.reliability.nack_threshold_ms = 60;
    config.reliability.recovery_scan_interval_ms = 30;
    config
}

// ── Fault relay ───────────────────────────────────────────────────────────────
//
// A client targets `relay.local_addr()` instead of the real sender. The relay
// forwards client → sender traffic untouched and applies `Fault` to sender →
// client traffic that matches `target_index`, once, then passes every later
// datagram (including retransmissions of that same index) straight through.

#[derive(Clone, Copy)]
enum Fault {
    DropOnce,
    TamperOnce,
}

struct FaultRelay {
    client_facing: Transport,
}

impl FaultRelay {
    async fn spawn(sender_addr: SocketAddr, target_index: u32, fault: Fault) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let client_facing = Transport::bind("127.0.0.1", 0).await.unwrap();
        let relay_addr = client_facing.local_addr().unwrap();
        let upstream = Transport::bind("127.0.0.1", 0).await.unwrap();
        let relay = FaultRelay { client_facing };

        let handle = tokio::spawn(async move {
            relay.run(upstream, sender_addr, target_index, fault).await;
        });
        (relay_addr, handle)
    }

    async fn run(self, upstream: Transport, sender_addr: SocketAddr, target_index: u32, fault: Fault) {
        let mut client_addr: Option<SocketAddr> = None;
        let mut fault_applied = false;
        let mut from_client = vec![0u8; wire::MAX_PAYLOAD + wire::HEADER_SIZE];
        let mut from_sender = vec![0u8; wire::MAX_PAYLOAD + wire::HEADER_SIZE];

        loop {
            tokio::select! {
                res = self.client_facing.recv(&mut from_client, Duration::from_secs(30)) => {
                    match res {
                        Ok(Some((len, from))) => {
                            client_addr = Some(from);
                            let _ = upstream.send_to(sender_addr, &from_client[..len]).await;
                        }
                        Ok(None) => continue,
                        Err(_) => break,
                    }
                }
                res = upstream.recv(&mut from_sender, Duration::from_secs(30)) => {
                    match res {
                        Ok(Some((len, _))) => {
                            let Some(client_addr) = client_addr else { continue };
                            let datagram = &from_sender[..len];
                            if let Some(forwarded) =
                                apply_fault(datagram, target_index, fault, &mut fault_applied)
                            {
                                let _ = self.client_facing.send_to(client_addr, &forwarded).await;
                            }
                        }
                        Ok(None) => continue,
                        Err(_) => break,
                    }
                }
            }
        }
    }
}

/// Apply `fault` to `datagram` if it is the first-seen CHUNK_DATA for
/// `target_index`. Returns `None` to drop, `Some(bytes)` to forward
/// (tampered or unchanged).
fn apply_fault(datagram: &[u8], target_index: u32, fault: Fault, applied: &mut bool) -> Option<Vec<u8>> {
    let Ok(packet) = Packet::decode(datagram) else {
        return Some(datagram.to_vec()); // not ours to police — forward as-is
    };
    if *applied || packet.packet_type() != PacketType::ChunkData || packet.sequence() != target_index {
        return Some(datagram.to_vec());
    }

    *applied = true;
    match fault {
        Fault::DropOnce => None,
        Fault::TamperOnce => {
            // Flip a payload bit in transit. The relay recomputes the wire
            // checksum on re-encode, so this corruption passes framing and
            // must be caught by the per-chunk hash (I5), not §4.3's checksum.
            let mut payload = packet.payload.clone();
            if let Some(last) = payload.last_mut() {
                *last ^= 0x01;
            }
            let redatagram = Packet::encode(
                packet.exposure_id(),
                PacketType::ChunkData,
                packet.sequence(),
                packet.header.flags,
                &payload,
            )
            .unwrap();
            Some(redatagram)
        }
    }
}

// ── E1: single-MTU transfer, loopback, no integrity layer ──────────────────────

#[tokio::test]
async fn e1_single_mtu_transfer_completes_with_no_retransmission() {
    let mut config = loopback_config();
    config.reliability.integrity_mode = "none".to_string();

    let payload = Bytes::from(vec![0x5a; 1200]);
    let session = SessionHandle::expose_bytes(config.clone(), payload.clone()).await.unwrap();
    let sender_addr = session.local_addr();
    let exposure_id = session.exposure_id();

    let client = ClientHandle::pull(config, sender_addr, exposure_id).await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), client.wait_complete())
        .await
        .expect("receiver did not finish in time");
    assert_eq!(state, rgt::ReceiverState::Done);

    let received = client.destroy().await.unwrap();
    assert_eq!(received, Some(payload));

    let sender_stats = session.snapshot_stats();
    assert_eq!(sender_stats.chunks_sent, 1);
    assert_eq!(sender_stats.retrans, 0);

    session.cancel();
    let _ = session.destroy().await;
}

// ── E2: three-chunk transfer with one dropped CHUNK_DATA ───────────────────────

#[tokio::test]
async fn e2_dropped_chunk_is_recovered_via_nack() {
    let mut config = loopback_config();
    config.network.chunk_size = Some(4); // 3 chunks of 4 bytes = 12 bytes total
    config.reliability.integrity_mode = "none".to_string();

    let payload = Bytes::from_static(b"abcdefghijkl"); // 12 bytes, 3 chunks
    let session = SessionHandle::expose_bytes(config.clone(), payload.clone()).await.unwrap();
    let sender_addr = session.local_addr();
    let exposure_id = session.exposure_id();

    let (relay_addr, relay_task) = FaultRelay::spawn(sender_addr, 1, Fault::DropOnce).await;

    let client = ClientHandle::pull(config, relay_addr, exposure_id).await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), client.wait_complete())
        .await
        .expect("receiver did not recover from the dropped chunk in time");
    assert_eq!(state, rgt::ReceiverState::Done);

    let received = client.destroy().await.unwrap();
    assert_eq!(received, Some(payload));

    // The dropped chunk can only have reached the receiver through a NACK
    // and a re-send — at least one retransmission must be on record.
    assert!(session.snapshot_stats().retrans >= 1);

    relay_task.abort();
    session.cancel();
    let _ = session.destroy().await;
}

// ── E3: out-of-order pull ──────────────────────────────────────────────────────

#[tokio::test]
async fn e3_out_of_order_pull_still_assembles_correctly() {
    const CHUNK_COUNT: u32 = 40;
    const CHUNK_SIZE: u32 = 4;
    let total = (CHUNK_COUNT * CHUNK_SIZE) as usize;
    let source: Vec<u8> = (0..total as u32).map(|i| (i % 251) as u8).collect();
    let source = Bytes::from(source);

    let manifest = Manifest::new(
        source.len() as u64,
        CHUNK_SIZE,
        IntegrityMode::None,
        CipherMode::None,
    );
    let surface = Arc::new(ExposureSurface::create(manifest, source.clone(), [0u8; 32]).unwrap());
    for index in 0..manifest.chunk_count {
        let bytes = surface.chunk_bytes(index).unwrap();
        surface.expose(index, &bytes).unwrap();
    }

    let sender_transport = Transport::bind("127.0.0.1", 0).await.unwrap();
    let sender_addr = sender_transport.local_addr().unwrap();
    let exposure_id = ExposureId::generate();
    let mut config = loopback_config();
    config.reliability.session_deadline_ms = 60_000;
    let engine = SenderEngine::new(exposure_id, surface, sender_transport, config, [0u8; 32]);
    let engine_task = tokio::spawn(engine.clone().run());

    let receiver_transport = Transport::bind("127.0.0.1", 0).await.unwrap();
    handshake::send_expose_request(&receiver_transport, sender_addr, exposure_id)
        .await
        .unwrap();

    // Pull a deliberately scrambled order: two "late" high indices first,
    // then the low end ascending. Every index in [0, CHUNK_COUNT) must still
    // appear exactly once across the whole list.
    let mut order = vec![CHUNK_COUNT - 1, CHUNK_COUNT / 2];
    for i in 0..CHUNK_COUNT {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    let payload = wire::encode_index_list(&order);
    let datagram = Packet::encode(exposure_id.0, PacketType::PullRequest, 0, 0, &payload).unwrap();
    receiver_transport.send_to(sender_addr, &datagram).await.unwrap();

    let mut received: HashMap<u32, Bytes> = HashMap::new();
    let mut running_total = 0usize;
    let mut buf = vec![0u8; wire::MAX_PAYLOAD + wire::HEADER_SIZE];
    while received.len() < CHUNK_COUNT as usize {
        let (len, _) = receiver_transport
            .recv(&mut buf, Duration::from_secs(10))
            .await
            .unwrap()
            .expect("timed out waiting for chunk data");
        let packet = Packet::decode(&buf[..len]).unwrap();
        if packet.packet_type() != PacketType::ChunkData {
            continue;
        }
        let index = packet.sequence();
        if received.contains_key(&index) {
            continue; // a duplicate resend — harmless, ignore
        }
        received.insert(index, Bytes::copy_from_slice(&packet.payload));
        running_total += packet.payload.len();
        assert!(running_total <= total); // bytes_received only ever grows
    }

    let mut assembled = vec![0u8; total];
    for (index, bytes) in &received {
        let start = *index as usize * CHUNK_SIZE as usize;
        assembled[start..start + bytes.len()].copy_from_slice(bytes);
    }
    assert_eq!(Bytes::from(assembled), source);

    engine.cancel();
    let _ = engine_task.await;
}

// ── E4: integrity failure is caught and the chunk is eventually recovered ──────

#[tokio::test]
async fn e4_tampered_chunk_is_dropped_then_recovered() {
    let mut config = loopback_config();
    config.network.chunk_size = Some(4);
    config.reliability.integrity_mode = "per_chunk_hash".to_string();

    const CHUNK_COUNT: usize = 10;
    let payload = Bytes::from(vec![0x7au8; CHUNK_COUNT * 4]);
    let session = SessionHandle::expose_bytes(config.clone(), payload.clone()).await.unwrap();
    let sender_addr = session.local_addr();
    let exposure_id = session.exposure_id();

    let (relay_addr, relay_task) = FaultRelay::spawn(sender_addr, 7, Fault::TamperOnce).await;

    let client = ClientHandle::pull(config, relay_addr, exposure_id).await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), client.wait_complete())
        .await
        .expect("receiver never recovered the tampered chunk");
    assert_eq!(state, rgt::ReceiverState::Done);

    let received = client.destroy().await.unwrap();
    assert_eq!(received, Some(payload)); // the untampered bytes, recovered by resend

    relay_task.abort();
    session.cancel();
    let _ = session.destroy().await;
}

// ── E5: cancellation tears down both ends within the grace window ─────────────

#[tokio::test]
async fn e5_cancel_mid_transfer_reaches_cancelled_on_both_ends() {
    let mut config = loopback_config();
    config.reliability.cancel_grace_ms = 300;
    config.reliability.session_deadline_ms = 60_000;

    let payload = Bytes::from(vec![0xcc; 4 * 1024 * 1024]);
    let session = SessionHandle::expose_bytes(config.clone(), payload).await.unwrap();
    let sender_addr = session.local_addr();
    let exposure_id = session.exposure_id();

    let client = ClientHandle::pull(config, sender_addr, exposure_id).await.unwrap();

    // Let the transfer get underway, then cancel both ends mid-flight.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.progress() < 1.0, "test finished before cancellation could race it");

    session.cancel();
    client.cancel();

    let sender_state = tokio::time::timeout(Duration::from_secs(2), session.wait_complete())
        .await
        .expect("sender never reached a terminal state after cancel");
    assert_eq!(sender_state, SenderState::Cancelled);

    let receiver_state = tokio::time::timeout(Duration::from_secs(2), client.wait_complete())
        .await
        .expect("receiver never reached a terminal state after cancel");
    assert_eq!(receiver_state, rgt::ReceiverState::Cancelled);

    let _ = session.destroy().await;
    let _ = client.destroy().await;
}

// ── E6: rate adaptation tracks synthetic pull pressure ─────────────────────────

#[tokio::test]
async fn e6_rate_rises_under_pressure_and_falls_when_silent() {
    let manifest = Manifest::new(4 * 4, 4, IntegrityMode::None, CipherMode::None);
    let source = Bytes::from(vec![0u8; 16]);
    let surface = Arc::new(ExposureSurface::create(manifest, source, [0u8; 32]).unwrap());
    for index in 0..manifest.chunk_count {
        let bytes = surface.chunk_bytes(index).unwrap();
        surface.expose(index, &bytes).unwrap();
    }

    let sender_transport = Transport::bind("127.0.0.1", 0).await.unwrap();
    let sender_addr = sender_transport.local_addr().unwrap();
    let exposure_id = ExposureId::generate();

    let mut config = loopback_config();
    config.network.initial_exposure_rate = 50.0;
    config.network.rate_min = 10.0;
    config.network.rate_max = 5_000.0;
    config.network.rate_tick_ms = 10;
    config.reliability.session_deadline_ms = 60_000;

    let engine = SenderEngine::new(exposure_id, surface, sender_transport, config, [0u8; 32]);
    let engine_task = tokio::spawn(engine.clone().run());

    let client_transport = Transport::bind("127.0.0.1", 0).await.unwrap();
    handshake::send_expose_request(&client_transport, sender_addr, exposure_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await; // let the handshake land

    let rate_before = engine.snapshot_stats().exposure_rate;

    // Hammer with NACKs every 10ms for ~300ms — enough ticks (at a 10ms
    // scheduling period) to drive several rate-controller increases.
    for _ in 0..30 {
        let datagram =
            Packet::encode(exposure_id.0, PacketType::ChunkNack, 0, 0, &wire::encode_index_list(&[0]))
                .unwrap();
        client_transport.send_to(sender_addr, &datagram).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let rate_under_pressure = engine.snapshot_stats().exposure_rate;
    assert!(
        rate_under_pressure > rate_before,
        "rate should climb under sustained pull pressure: {rate_before} -> {rate_under_pressure}"
    );
    assert!(rate_under_pressure <= 5_000.0);

    // Go silent for long enough to observe several decay ticks.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let rate_after_silence = engine.snapshot_stats().exposure_rate;
    assert!(
        rate_after_silence < rate_under_pressure,
        "rate should decay once pull pressure stops: {rate_under_pressure} -> {rate_after_silence}"
    );
    assert!(rate_after_silence >= 10.0);

    engine.cancel();
    let _ = engine_task.await;
}

// ── Eager push: sender announces the manifest unsolicited ─────────────────────
//
// §9 "push vs pull" resolves to pull-driven by default with an opt-in
// `eager_push` mode for loopback/benchmark use: it skips the receiver having
// to send EXPOSE_REQUEST first (the sender announces EXPOSE_MANIFEST and
// CHUNK_AVAILABLE on its own), but actual CHUNK_DATA still only moves once
// the receiver pulls — §5's "PULL/NACK delivery is unordered" ordering
// guarantee holds either way. Exercised at the engine level (like E3/E6)
// since `eager_push_peer` must name the receiver's address before the
// receiver exists, which the handle API's `ClientHandle::accept` wrapper
// can't arrange without its own transport already bound.

#[tokio::test]
async fn eager_push_skips_the_receiver_initiated_handshake() {
    let receiver_transport = Transport::bind("127.0.0.1", 0).await.unwrap();
    let receiver_addr = receiver_transport.local_addr().unwrap();

    let payload = Bytes::from_static(b"pushed without being asked");
    let manifest = Manifest::new(payload.len() as u64, 4, IntegrityMode::None, CipherMode::None);
    let surface = Arc::new(ExposureSurface::create(manifest, payload.clone(), [0u8; 32]).unwrap());
    for index in 0..manifest.chunk_count {
        let bytes = surface.chunk_bytes(index).unwrap();
        surface.expose(index, &bytes).unwrap();
    }

    let sender_transport = Transport::bind("127.0.0.1", 0).await.unwrap();
    let sender_addr = sender_transport.local_addr().unwrap();
    let exposure_id = ExposureId::generate();
    let mut config = loopback_config();
    config.reliability.eager_push = true;
    config.network.eager_push_peer = Some(receiver_addr.to_string());
    config.reliability.session_deadline_ms = 60_000;

    let engine = SenderEngine::new(exposure_id, surface, sender_transport, config.clone(), [0u8; 32]);
    let engine_task = tokio::spawn(engine.clone().run());

    let receiver = ReceiverEngine::accept_pushed(
        receiver_transport,
        sender_addr,
        exposure_id,
        config,
        [0u8; 32],
    )
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(5), receiver.clone().run())
        .await
        .expect("receiver never finished draining the pushed object")
        .unwrap();
    assert_eq!(receiver.state().await, ReceiverState::Done);
    assert_eq!(receiver.take_completed(), Some(payload));

    engine.cancel();
    let _ = engine_task.await;
}
