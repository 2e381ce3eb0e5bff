//! # wlanprobe
//!
//! Measures one-way delay and packet loss to a peer running the same binary.
//!
//! ## Usage
//!
//! ```bash
//! # Discover the peer by broadcast on the default port
//! wlanprobe
//!
//! # Fixed peer, 5% simulated loss, reproducible drops
//! wlanprobe --peer 192.168.1.20:5100 --loss 5 --seed 7
//!
//! # Everything from a file
//! wlanprobe --config wlanprobe.toml
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wlanprobe::config::EngineConfig;
use wlanprobe::publisher::{LogObserver, StatisticsPublisher, StatsRegistry};
use wlanprobe::ProbeChannel;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let config = parse_args()?;

    tracing::info!(
        port = config.port,
        peer = ?config.peer,
        loss = config.loss.probability,
        seed = config.loss.seed,
        fec_block = config.fec.block_size,
        window = config.stats.window_size,
        "wlanprobe starting"
    );

    // ── Engine ──────────────────────────────────────────────────
    let registry = Arc::new(StatsRegistry::new());
    let publisher = Arc::new(StatisticsPublisher::new(registry.clone()));
    let log_observer = publisher.add_observer(Arc::new(LogObserver));

    let port = config.port;
    let channel = ProbeChannel::new(config, publisher.clone());
    if !channel.initialize(port) {
        tracing::warn!(port, "running without network: no statistics will be produced");
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    // ── Cleanup ─────────────────────────────────────────────────
    channel.shutdown();
    publisher.remove_observer(log_observer);
    for stats in registry.snapshot() {
        tracing::info!(
            peer = %stats.name,
            avg_ms = stats.average,
            wire_plr = stats.wire_plr,
            effective_plr = stats.effective_plr,
            "final statistics"
        );
    }
    tracing::info!(published = publisher.published(), "wlanprobe stopped");

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut port: Option<u16> = None;
    let mut peer: Option<SocketAddr> = None;
    let mut loss_percent: Option<f64> = None;
    let mut seed: Option<u64> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config_path = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?
                        .clone(),
                );
            }
            "--port" | "-p" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--port requires a value"))?;
                port = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid port '{}': {}", val, e))?,
                );
            }
            "--peer" | "-P" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--peer requires a value"))?;
                peer = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid peer address '{}': {}", val, e))?,
                );
            }
            "--loss" | "-l" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--loss requires a value"))?;
                loss_percent = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid loss percent '{}': {}", val, e))?,
                );
            }
            "--seed" | "-s" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--seed requires a value"))?;
                seed = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid seed '{}': {}", val, e))?,
                );
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };

    // Fallback: env vars
    if port.is_none() {
        if let Ok(val) = std::env::var("WLANPROBE_PORT") {
            port = val.parse().ok();
        }
    }
    if peer.is_none() {
        if let Ok(val) = std::env::var("WLANPROBE_PEER") {
            let val = val.trim();
            if !val.is_empty() {
                peer = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid WLANPROBE_PEER '{}': {}", val, e))?,
                );
            }
        }
    }

    if let Some(port) = port {
        config.port = port;
    }
    if peer.is_some() {
        config.peer = peer;
    }
    if let Some(percent) = loss_percent {
        if !(0.0..=100.0).contains(&percent) {
            anyhow::bail!("--loss must be between 0 and 100, got {percent}");
        }
        config.loss.probability = percent / 100.0;
    }
    if let Some(seed) = seed {
        config.loss.seed = seed;
    }

    Ok(config)
}

fn print_help() {
    eprintln!(
        r#"wlanprobe: two-peer one-way delay and packet loss tester

USAGE:
  wlanprobe [OPTIONS]

OPTIONS:
  --config, -c <path>     TOML configuration file
  --port, -p <port>       UDP probe port (default: 5100)
  --peer, -P <addr>       Peer address, e.g. 192.168.1.20:5100
                           (default: discover by broadcast)
  --loss, -l <percent>    Simulated wire loss in percent (default: 3)
  --seed, -s <n>          Loss simulator seed
  --help, -h              Show this help

ENVIRONMENT VARIABLES:
  WLANPROBE_PORT   Probe port (fallback for --port)
  WLANPROBE_PEER   Peer address (fallback for --peer)
  RUST_LOG         Log level filter (e.g. info, debug, wlanprobe=trace)

EXAMPLES:
  # Two hosts on the same LAN, both run:
  wlanprobe

  # Fixed peer without simulated loss
  wlanprobe --peer 192.168.1.20:5100 --loss 0
"#
    );
}
