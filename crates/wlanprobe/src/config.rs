//! Engine configuration: compiled-in defaults, optionally overridden by a
//! versioned TOML file.

use std::net::{AddrParseError, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use wlanprobe_transport::clock::DEFAULT_OFFSET_ALPHA;
use wlanprobe_transport::codec::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use wlanprobe_transport::loss::DEFAULT_LOSS_PROBABILITY;
use wlanprobe_transport::receiver::ReceiverConfig;

pub const CONFIG_VERSION: u32 = 1;

/// Well-known probe port.
pub const SERVER_PORT: u16 = 5100;

pub const DEFAULT_LOSS_SEED: u64 = 0x5EED;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid peer address '{addr}': {source}")]
    InvalidPeer {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("fec.block_size {0} outside {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}")]
    BlockSize(usize),
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ─── TOML Input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub version: u32,
    pub port: Option<u16>,
    pub peer: Option<String>,
    pub broadcast_discovery: Option<bool>,
    pub probe: ProbeConfigInput,
    pub loss: LossConfigInput,
    pub fec: FecConfigInput,
    pub stats: StatsConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfigInput {
    pub interval_ms: Option<u64>,
    pub echo_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LossConfigInput {
    pub probability: Option<f64>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub block_size: Option<usize>,
    pub max_tracked_blocks: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatsConfigInput {
    pub window_size: Option<usize>,
    pub publish_interval_ms: Option<u64>,
    pub clock_alpha: Option<f64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Cadence of probe datagrams.
    pub interval: Duration,
    /// Cadence of clock-sync echo requests.
    pub echo_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            echo_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LossConfig {
    pub probability: f64,
    pub seed: u64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            probability: DEFAULT_LOSS_PROBABILITY,
            seed: DEFAULT_LOSS_SEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecConfig {
    /// Probes per parity block; both peers must agree.
    pub block_size: usize,
    pub max_tracked_blocks: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        let rx = ReceiverConfig::default();
        Self {
            block_size: rx.fec_block_size,
            max_tracked_blocks: rx.max_tracked_blocks,
        }
    }
}

impl FecConfig {
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            fec_block_size: self.block_size,
            max_tracked_blocks: self.max_tracked_blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsConfig {
    /// Samples kept per peer.
    pub window_size: usize,
    pub publish_interval: Duration,
    /// EWMA weight for clock offset refinement.
    pub clock_alpha: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            publish_interval: Duration::from_millis(1000),
            clock_alpha: DEFAULT_OFFSET_ALPHA,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub version: u32,
    pub port: u16,
    /// Fixed peer; discovered at runtime when `None`.
    pub peer: Option<SocketAddr>,
    /// Broadcast probes until a peer is known.
    pub broadcast_discovery: bool,
    pub probe: ProbeConfig,
    pub loss: LossConfig,
    pub fec: FecConfig,
    pub stats: StatsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            port: SERVER_PORT,
            peer: None,
            broadcast_discovery: true,
            probe: ProbeConfig::default(),
            loss: LossConfig::default(),
            fec: FecConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

fn interval(ms: Option<u64>, default: Duration) -> Duration {
    ms.map(|ms| Duration::from_millis(ms.max(1)))
        .unwrap_or(default)
}

impl EngineConfigInput {
    pub fn resolve(self) -> Result<EngineConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = EngineConfig::default();

        let peer = match self.peer.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(addr) => Some(addr.parse().map_err(|source| ConfigError::InvalidPeer {
                addr: addr.to_string(),
                source,
            })?),
        };

        let probe = ProbeConfig {
            interval: interval(self.probe.interval_ms, defaults.probe.interval),
            echo_interval: interval(self.probe.echo_interval_ms, defaults.probe.echo_interval),
        };

        let probability = match self.loss.probability {
            Some(p) if p.is_finite() => p.clamp(0.0, 1.0),
            _ => defaults.loss.probability,
        };
        let loss = LossConfig {
            probability,
            seed: self.loss.seed.unwrap_or(defaults.loss.seed),
        };

        let block_size = self.fec.block_size.unwrap_or(defaults.fec.block_size);
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(ConfigError::BlockSize(block_size));
        }
        let fec = FecConfig {
            block_size,
            max_tracked_blocks: self
                .fec
                .max_tracked_blocks
                .unwrap_or(defaults.fec.max_tracked_blocks)
                .max(1),
        };

        let clock_alpha = match self.stats.clock_alpha {
            Some(a) if a.is_finite() && a > 0.0 => a.min(1.0),
            _ => defaults.stats.clock_alpha,
        };
        let stats = StatsConfig {
            window_size: self
                .stats
                .window_size
                .unwrap_or(defaults.stats.window_size)
                .max(1),
            publish_interval: interval(
                self.stats.publish_interval_ms,
                defaults.stats.publish_interval,
            ),
            clock_alpha,
        };

        Ok(EngineConfig {
            version,
            port: self.port.unwrap_or(defaults.port),
            peer,
            broadcast_discovery: self
                .broadcast_discovery
                .unwrap_or(defaults.broadcast_discovery),
            probe,
            loss,
            fec,
            stats,
        })
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let parsed: EngineConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
