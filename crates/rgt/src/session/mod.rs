//! Session layer (C8) — lifecycle, handshake, cancellation, timeouts.
//!
//! This module wires the `rgt-core` wire codec and `rgt-surface` surfaces to
//! a `Transport`, producing the two state machines of §4.6/§4.7. Grounded on
//! the reference daemon's `summitd::session`/`summitd::chunk` split: a
//! handshake module that gets a peer to a known surface, and per-role engine
//! modules that each run as a single cooperatively-scheduled task (the three
//! logical workers of §5 collapsed onto one `tokio::select!` loop, which the
//! spec explicitly permits for the producer/emitter pair and for Recovery).

pub mod handshake;
pub mod receiver;
pub mod sender;

pub use receiver::{ReceiverEngine, ReceiverState};
pub use sender::{SenderEngine, SenderState};
