//! RGT wire format — on-wire types for the exposure protocol.
//!
//! These types ARE the protocol. Every field, every size, every reserved
//! byte is part of the wire format. All multi-byte integers are explicit
//! big-endian via `zerocopy::byteorder`, so the header struct is safe to
//! read and write directly without manual shuffling and without triggering
//! unaligned-access UB — every field has alignment 1. There is no unsafe
//! code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U128, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Current wire format version.
pub const VERSION: u8 = 1;

/// Size of [`PacketHeader`] on the wire, in bytes.
pub const HEADER_SIZE: usize = 32;

/// Maximum payload bytes permitted in a single datagram (excludes header).
///
/// Chosen so header + payload + worst-case per-chunk hash/cipher overhead
/// stays well under common path MTUs when chunk_size is MTU-class (§6).
pub const MAX_PAYLOAD: usize = 65_507; // max UDP payload over IPv4 loopback-class paths

// ── Packet header ─────────────────────────────────────────────────────────────

/// The common header prefixing every RGT datagram.
///
/// Wire size: 32 bytes.
///
/// ```text
/// version:u8  type:u8  flags:u8  reserved:u8
/// exposure_id:u128
/// sequence:u32         // per-surface sender sequence or chunk index (type-dependent)
/// payload_size:u32
/// checksum:u32         // over header (with checksum=0) + payload
/// ```
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: u8,
    pub flags: u8,
    pub reserved: u8,
    pub exposure_id: U128<BigEndian>,
    pub sequence: U32<BigEndian>,
    pub payload_size: U32<BigEndian>,
    pub checksum: U32<BigEndian>,
}

assert_eq_size!(PacketHeader, [u8; HEADER_SIZE]);

/// Flag bits carried in [`PacketHeader::flags`].
pub mod flags {
    /// CHUNK_DATA payload is followed by a 32-byte per-chunk hash.
    pub const HAS_HASH: u8 = 0x01;
    /// Payload is encrypted with the session's `stream_xor` cipher.
    pub const ENCRYPTED: u8 = 0x02;
    /// CHUNK_ACK payload uses the bitmap-delta encoding rather than an
    /// index list (see §9 "ACK payload format").
    pub const ACK_BITMAP_DELTA: u8 = 0x04;
}

// ── Packet types ──────────────────────────────────────────────────────────────

/// RGT packet type codes (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    ExposeRequest = 0x01,
    ExposeManifest = 0x02,
    ChunkAvailable = 0x03,
    PullRequest = 0x04,
    ChunkData = 0x05,
    ChunkAck = 0x06,
    ChunkNack = 0x07,
    ExposureComplete = 0x08,
    Cancel = 0x09,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ExposeRequest),
            0x02 => Ok(Self::ExposeManifest),
            0x03 => Ok(Self::ChunkAvailable),
            0x04 => Ok(Self::PullRequest),
            0x05 => Ok(Self::ChunkData),
            0x06 => Ok(Self::ChunkAck),
            0x07 => Ok(Self::ChunkNack),
            0x08 => Ok(Self::ExposureComplete),
            0x09 => Ok(Self::Cancel),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// A decoded packet: header plus the payload slice that followed it.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet and frame it as a single datagram, computing the
    /// checksum over `header (with checksum=0) || payload`.
    pub fn encode(
        exposure_id: u128,
        packet_type: PacketType,
        sequence: u32,
        flags: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let mut header = PacketHeader {
            version: VERSION,
            packet_type: packet_type.into(),
            flags,
            reserved: 0,
            exposure_id: U128::new(exposure_id),
            sequence: U32::new(sequence),
            payload_size: U32::new(payload.len() as u32),
            checksum: U32::new(0),
        };

        let checksum = checksum_over(header.as_bytes(), payload);
        header.checksum = U32::new(checksum);

        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Parse a datagram into header + payload, validating version, bounds,
    /// and checksum. Returns [`WireError::MalformedPacket`] (wrapping the
    /// specific reason) on any failure — callers drop the packet and move on.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }

        let mut header = PacketHeader::read_from_prefix(datagram).ok_or(WireError::Truncated)?;
        let claimed_checksum = header.checksum.get();
        header.checksum = U32::new(0);

        let payload_size = header.payload_size.get() as usize;
        let payload_start = HEADER_SIZE;
        let payload_end = payload_start
            .checked_add(payload_size)
            .ok_or(WireError::PayloadTooLarge(payload_size))?;
        if payload_end > datagram.len() {
            return Err(WireError::PayloadTooLarge(payload_size));
        }

        let payload = &datagram[payload_start..payload_end];
        let computed = checksum_over(header.as_bytes(), payload);
        if computed != claimed_checksum {
            return Err(WireError::ChecksumMismatch);
        }

        if header.version != VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        PacketType::try_from(header.packet_type)?;

        header.checksum = U32::new(claimed_checksum);
        Ok(Packet {
            header,
            payload: payload.to_vec(),
        })
    }

    pub fn packet_type(&self) -> PacketType {
        // decode() already validated this byte, so this cannot fail.
        PacketType::try_from(self.header.packet_type).expect("validated by decode")
    }

    pub fn exposure_id(&self) -> u128 {
        self.header.exposure_id.get()
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence.get()
    }
}

/// Checksum over header bytes (with the checksum field zeroed) + payload.
///
/// Not a cryptographic integrity check — that is the job of the optional
/// per-chunk hash (§4.5). This is a transport-level corruption guard, so a
/// cheap 32-bit BLAKE3-derived digest is used rather than a second hash
/// primitive.
fn checksum_over(header_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(header_bytes);
    hasher.update(payload);
    let digest = hasher.finalize();
    u32::from_be_bytes(digest.as_bytes()[..4].try_into().unwrap())
}

/// Encode a list of u32 chunk indices (PULL_REQUEST / CHUNK_NACK / index-list
/// CHUNK_ACK payloads) as big-endian u32s back to back.
pub fn encode_index_list(indices: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(indices.len() * 4);
    for i in indices {
        out.extend_from_slice(&i.to_be_bytes());
    }
    out
}

/// Decode a list of u32 chunk indices. Fails if the payload length is not a
/// multiple of 4.
pub fn decode_index_list(payload: &[u8]) -> Result<Vec<u32>, WireError> {
    if payload.len() % 4 != 0 {
        return Err(WireError::Truncated);
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
        .collect())
}

/// Encode a bitmap-delta CHUNK_ACK payload: a `from_index:u32` followed by
/// the raw big-endian words of the bitmap slice starting there.
pub fn encode_bitmap_delta(from_index: u32, words: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + words.len() * 8);
    out.extend_from_slice(&from_index.to_be_bytes());
    for w in words {
        out.extend_from_slice(&w.to_be_bytes());
    }
    out
}

/// Decode a bitmap-delta CHUNK_ACK payload produced by [`encode_bitmap_delta`].
pub fn decode_bitmap_delta(payload: &[u8]) -> Result<(u32, Vec<u64>), WireError> {
    if payload.len() < 4 || (payload.len() - 4) % 8 != 0 {
        return Err(WireError::Truncated);
    }
    let from_index = u32::from_be_bytes(payload[..4].try_into().unwrap());
    let words = payload[4..]
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();
    Ok((from_index, words))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated or shorter than the {HEADER_SIZE}-byte header")]
    Truncated,

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown packet type byte: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("checksum mismatch — datagram corrupted in transit")]
    ChecksumMismatch,

    #[error("unknown {0} byte: 0x{1:02x}")]
    UnknownMode(&'static str, u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
