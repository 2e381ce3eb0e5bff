//! # wlanprobe
//!
//! Two-peer one-way delay and packet loss engine.
//!
//! A [`channel::ProbeChannel`] binds the probe port and runs three threads:
//! receive (loss simulation, parity recovery, clock correction), send
//! (probe, parity and echo cadence) and stats (windowed aggregation and
//! publish). Snapshots reach consumers through
//! [`publisher::StatisticsObserver`] callbacks and the shared
//! [`publisher::StatsRegistry`].
//!
//! ## Crate structure
//!
//! - [`config`]: Defaults and versioned TOML configuration
//! - [`aggregator`]: Per-peer delay windows and loss tallies
//! - [`publisher`]: Observer fan-out, registry, queue and log observers
//! - [`channel`]: Socket lifecycle and engine threads

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod publisher;

pub use channel::ProbeChannel;
pub use config::{EngineConfig, SERVER_PORT};
pub use publisher::{StatisticsObserver, StatisticsPublisher, StatsRegistry};
pub use wlanprobe_transport::stats::Statistics;
