//! # wlanprobe-transport
//!
//! Socket-free protocol logic for the wlanprobe two-peer latency tester.
//!
//! Fixed-size probe datagrams, XOR parity FEC over blocks of consecutive
//! probes, seeded loss simulation, echo-based clock offset estimation, and
//! bounded-window delay statistics.
//!
//! ## Crate structure
//!
//! - [`wire`]: 40-byte frame codec (probe, parity, echo request/reply)
//! - [`clock`]: Microsecond timestamp clock and peer clock sync
//! - [`codec`]: FEC encoding/decoding (XOR parity, one erasure per block)
//! - [`loss`]: Seeded wire-loss simulator
//! - [`sender`]: Probe sequencing and parity emission
//! - [`receiver`]: Per-peer loss/FEC state machine and loss accounting
//! - [`stats`]: Delay window, Welford moments, percentiles, `Statistics`

pub mod clock;
pub mod codec;
pub mod loss;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod wire;
