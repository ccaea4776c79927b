//! The exposure [`Manifest`] and the identifiers surfaces are multiplexed by.

use rand::RngCore;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::wire::WireError;

/// 128-bit opaque identifier generated by the sender when an exposure
/// surface is created. Every wire packet carries one to multiplex surfaces
/// sharing a socket; there is no 32-bit legacy form (§9, resolved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExposureId(pub u128);

impl ExposureId {
    /// Generate a fresh, high-probability-unique id.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let hi = rng.next_u64();
        let lo = rng.next_u64();
        Self(((hi as u128) << 64) | lo as u128)
    }
}

impl std::fmt::Display for ExposureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Integrity mode negotiated for an exposure (manifest field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IntegrityMode {
    None = 0,
    PerChunkHash = 1,
}

impl TryFrom<u8> for IntegrityMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::PerChunkHash),
            other => Err(WireError::UnknownMode("integrity_mode", other)),
        }
    }
}

/// Cipher mode negotiated for an exposure (manifest field).
///
/// `StreamXor` is explicitly **not** a cryptographically strong cipher (§9):
/// it provides confidentiality against a passive observer who does not know
/// the pre-shared key, nothing more — no authentication, no replay
/// protection, no forward secrecy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherMode {
    None = 0,
    StreamXor = 1,
}

impl TryFrom<u8> for CipherMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::StreamXor),
            other => Err(WireError::UnknownMode("cipher_mode", other)),
        }
    }
}

/// Immutable descriptor exchanged at handshake (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manifest {
    pub total_size: u64,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub integrity_mode: IntegrityMode,
    pub cipher_mode: CipherMode,
}

impl Manifest {
    /// Build a manifest for an object of `total_size` bytes chunked at
    /// `chunk_size`, computing `chunk_count = ceil(total_size / chunk_size)`.
    pub fn new(
        total_size: u64,
        chunk_size: u32,
        integrity_mode: IntegrityMode,
        cipher_mode: CipherMode,
    ) -> Self {
        let chunk_count = if total_size == 0 {
            0
        } else {
            ((total_size + chunk_size as u64 - 1) / chunk_size as u64) as u32
        };
        Self {
            total_size,
            chunk_count,
            chunk_size,
            integrity_mode,
            cipher_mode,
        }
    }

    /// Length in bytes of chunk `index`. The last chunk may be shorter.
    pub fn chunk_len(&self, index: u32) -> u32 {
        if index + 1 == self.chunk_count {
            let consumed = index as u64 * self.chunk_size as u64;
            (self.total_size - consumed) as u32
        } else {
            self.chunk_size
        }
    }

    /// Encode as the EXPOSE_MANIFEST payload.
    pub fn encode(&self) -> Vec<u8> {
        let raw = RawManifest {
            total_size: U64::new(self.total_size),
            chunk_count: U32::new(self.chunk_count),
            chunk_size: U32::new(self.chunk_size),
            integrity_mode: self.integrity_mode as u8,
            cipher_mode: self.cipher_mode as u8,
            reserved: [0; 6],
        };
        raw.as_bytes().to_vec()
    }

    /// Decode an EXPOSE_MANIFEST payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let raw = RawManifest::read_from(payload).ok_or(WireError::Truncated)?;
        Ok(Manifest {
            total_size: raw.total_size.get(),
            chunk_count: raw.chunk_count.get(),
            chunk_size: raw.chunk_size.get(),
            integrity_mode: IntegrityMode::try_from(raw.integrity_mode)?,
            cipher_mode: CipherMode::try_from(raw.cipher_mode)?,
        })
    }
}

/// Fixed-layout encoding of [`Manifest`] — 24 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct RawManifest {
    total_size: U64<BigEndian>,
    chunk_count: U32<BigEndian>,
    chunk_size: U32<BigEndian>,
    integrity_mode: u8,
    cipher_mode: u8,
    reserved: [u8; 6],
}

assert_eq_size!(RawManifest, [u8; 24]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        let m = Manifest::new(10, 4, IntegrityMode::None, CipherMode::None);
        assert_eq!(m.chunk_count, 3);
        assert_eq!(m.chunk_len(0), 4);
        assert_eq!(m.chunk_len(1), 4);
        assert_eq!(m.chunk_len(2), 2);
    }

    #[test]
    fn empty_object_has_no_chunks() {
        let m = Manifest::new(0, 4, IntegrityMode::None, CipherMode::None);
        assert_eq!(m.chunk_count, 0);
    }

    #[test]
    fn manifest_round_trips() {
        let m = Manifest::new(
            10 * 1024 * 1024 + 7,
            1400,
            IntegrityMode::PerChunkHash,
            CipherMode::StreamXor,
        );
        let encoded = m.encode();
        let decoded = Manifest::decode(&encoded).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn exposure_ids_are_distinct() {
        let a = ExposureId::generate();
        let b = ExposureId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn manifest_decode_rejects_truncated_payload() {
        let err = Manifest::decode(&[0u8; 4]).unwrap_err();
        assert_eq!(err, WireError::Truncated);
    }
}
