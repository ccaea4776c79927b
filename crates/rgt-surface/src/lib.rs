//! Chunk bitmap, exposure/receive surfaces, rate controller, and reliable
//! layer for Red Giant Transport (RGT): C1, C2, C4, C5, and C7's data side.
//!
//! Depends on `rgt-core` for wire types and crypto helpers; has no socket of
//! its own — the `rgt` crate wires these surfaces to a transport and a
//! session state machine.

pub mod bitmap;
pub mod error;
pub mod exposure;
pub mod rate;
pub mod receive;
pub mod reliable;

pub use bitmap::ChunkBitmap;
pub use error::SurfaceError;
pub use exposure::{ExposureSurface, RetryState, Stats as ExposureStats};
pub use rate::RateController;
pub use receive::{ReceiveSurface, Stats as ReceiveStats};
pub use reliable::{ReliablePolicy, RetryBatch};
