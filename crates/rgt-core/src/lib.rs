//! Wire format, manifest, crypto helpers, and configuration for Red Giant
//! Transport (RGT) — the core types shared by sender and receiver engines.
//!
//! This crate has no network or async dependency of its own; it is pure
//! encode/decode/config logic consumed by `rgt-surface` and `rgt`.

pub mod config;
pub mod crypto;
pub mod manifest;
pub mod wire;

pub use config::RgtConfig;
pub use manifest::{CipherMode, ExposureId, IntegrityMode, Manifest};
pub use wire::{Packet, PacketHeader, PacketType, WireError};
