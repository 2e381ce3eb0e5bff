//! # Probe Channel
//!
//! Owns the UDP socket and the three engine threads:
//!
//! ```text
//!   wlanprobe-tx ──probe/parity/echo──▶ peer
//!
//!   peer ──datagram──▶ wlanprobe-rx ──▶ ProbeReceiver ──▶ ClockSync
//!                                                   │
//!                                   StatsUpdate (bounded, try_send)
//!                                                   ▼
//!                          wlanprobe-stats ──tick──▶ StatisticsPublisher
//! ```
//!
//! `initialize` binds `0.0.0.0:port` and starts the threads; `shutdown`
//! stops the receive thread first (flag + wake-up datagram + read timeout),
//! then the timer threads, then releases the socket.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, trace, warn};
use wlanprobe_transport::clock::{ClockSync, TimestampClock};
use wlanprobe_transport::loss::LossSimulator;
use wlanprobe_transport::receiver::ProbeReceiver;
use wlanprobe_transport::sender::ProbeSender;
use wlanprobe_transport::wire::{EchoReply, EchoRequest, Frame, Packet, ProbePacket, FRAME_LEN};

use crate::aggregator::{Aggregator, StatsUpdate};
use crate::config::EngineConfig;
use crate::publisher::StatisticsPublisher;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const INGEST_CAPACITY: usize = 4096;
const COUNTER_LOG_INTERVAL: Duration = Duration::from_secs(5);

// ─── Shared State ───────────────────────────────────────────────────────────

/// State shared by the rx and tx threads of one running channel.
struct Shared {
    instance_id: u32,
    clock: TimestampClock,
    /// Current peer; fixed by config or learned from the first foreign datagram.
    peer: ArcSwapOption<SocketAddr>,
    sync: Mutex<ClockSync>,
    clock_alpha: f64,
    ingest_dropped: AtomicU64,
}

impl Shared {
    fn reset_sync(&self) {
        *self.sync.lock().unwrap_or_else(|e| e.into_inner()) = ClockSync::new(self.clock_alpha);
    }
}

/// Live engine threads and the socket they share.
struct Running {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    /// Dropping this wakes and stops the tx and stats threads.
    stop_tx: Option<Sender<()>>,
    shared: Arc<Shared>,
    rx_handle: Option<JoinHandle<()>>,
    timer_handles: Vec<JoinHandle<()>>,
}

impl Running {
    fn stop(mut self) {
        // (a) receive flow
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.socket.send_to(&[], wake_addr(self.local_addr)) {
            debug!(error = %e, "wake-up datagram failed, relying on read timeout");
        }
        if let Some(h) = self.rx_handle.take() {
            let _ = h.join();
        }

        // (b) timers
        drop(self.stop_tx.take());
        for h in self.timer_handles.drain(..) {
            let _ = h.join();
        }

        // (c) socket is released when the last Arc drops here
        debug!(addr = %self.local_addr, "probe channel stopped");
    }
}

/// Loopback address that reaches a socket bound to `local`.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    if local.ip().is_unspecified() {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, local.port()))
    } else {
        local
    }
}

// ─── Probe Channel ──────────────────────────────────────────────────────────

/// One probe endpoint. At most one may be bound per host and port.
pub struct ProbeChannel {
    config: EngineConfig,
    publisher: Arc<StatisticsPublisher>,
    state: Mutex<Option<Running>>,
}

impl ProbeChannel {
    pub fn new(config: EngineConfig, publisher: Arc<StatisticsPublisher>) -> Self {
        ProbeChannel {
            config,
            publisher,
            state: Mutex::new(None),
        }
    }

    /// Bind `0.0.0.0:port` and start probing. Returns `false` if the port is
    /// taken, threads cannot be spawned, or the channel is already running.
    pub fn initialize(&self, port: u16) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_some() {
            warn!(port, "probe channel already initialized");
            return false;
        }
        match self.start(port) {
            Ok(running) => {
                info!(
                    addr = %running.local_addr,
                    instance = format_args!("{:08x}", running.shared.instance_id),
                    peer = ?self.config.peer,
                    "probe channel up"
                );
                *state = Some(running);
                true
            }
            Err(e) => {
                error!(port, error = %format!("{e:#}"), "probe channel initialization failed");
                false
            }
        }
    }

    /// Stop all threads and release the socket. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let running = self.state.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            running.stop();
            info!("probe channel shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.with_running(|r| r.local_addr)
    }

    /// Peer currently probed, if known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.with_running(|r| r.shared.peer.load_full().map(|p| *p))
            .flatten()
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.with_running(|r| r.shared.instance_id)
    }

    pub fn is_synchronized(&self) -> bool {
        self.with_running(|r| {
            r.shared
                .sync
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_synchronized()
        })
        .unwrap_or(false)
    }

    /// Updates dropped because the stats thread fell behind.
    pub fn ingest_dropped(&self) -> u64 {
        self.with_running(|r| r.shared.ingest_dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn publisher(&self) -> &Arc<StatisticsPublisher> {
        &self.publisher
    }

    fn with_running<T>(&self, f: impl FnOnce(&Running) -> T) -> Option<T> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(f)
    }

    fn start(&self, port: u16) -> Result<Running> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .with_context(|| format!("bind 0.0.0.0:{port}"))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        if self.config.broadcast_discovery && self.config.peer.is_none() {
            socket.set_broadcast(true)?;
        }
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let shared = Arc::new(Shared {
            instance_id: rand::random(),
            clock: TimestampClock::new(),
            peer: ArcSwapOption::from(self.config.peer.map(Arc::new)),
            sync: Mutex::new(ClockSync::new(self.config.stats.clock_alpha)),
            clock_alpha: self.config.stats.clock_alpha,
            ingest_dropped: AtomicU64::new(0),
        });

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (ingest_tx, ingest_rx) = bounded::<StatsUpdate>(INGEST_CAPACITY);

        let mut spawned = Running {
            socket: socket.clone(),
            local_addr,
            running: running.clone(),
            stop_tx: Some(stop_tx),
            shared: shared.clone(),
            rx_handle: None,
            timer_handles: Vec::new(),
        };

        let spawn_all = |spawned: &mut Running| -> Result<()> {
            let rx = RxLoop {
                socket: socket.clone(),
                shared: shared.clone(),
                running: running.clone(),
                ingest: ingest_tx,
                config: self.config.clone(),
                link: None,
            };
            spawned.rx_handle = Some(
                thread::Builder::new()
                    .name("wlanprobe-rx".into())
                    .spawn(move || rx.run())
                    .context("spawn wlanprobe-rx")?,
            );

            let tx = TxLoop {
                socket: socket.clone(),
                shared: shared.clone(),
                broadcast: self.config.broadcast_discovery,
                port: local_addr.port(),
                sender: ProbeSender::new(shared.instance_id, self.config.fec.block_size),
                interval: self.config.probe.interval,
                echo_interval: self.config.probe.echo_interval,
            };
            let stop = stop_rx.clone();
            spawned.timer_handles.push(
                thread::Builder::new()
                    .name("wlanprobe-tx".into())
                    .spawn(move || tx.run(stop))
                    .context("spawn wlanprobe-tx")?,
            );

            let publisher = self.publisher.clone();
            let window_size = self.config.stats.window_size;
            let publish_interval = self.config.stats.publish_interval;
            let stop = stop_rx.clone();
            spawned.timer_handles.push(
                thread::Builder::new()
                    .name("wlanprobe-stats".into())
                    .spawn(move || {
                        stats_loop(
                            Aggregator::new(window_size),
                            ingest_rx,
                            stop,
                            publish_interval,
                            &publisher,
                        )
                    })
                    .context("spawn wlanprobe-stats")?,
            );
            Ok(())
        };

        match spawn_all(&mut spawned) {
            Ok(()) => Ok(spawned),
            Err(e) => {
                spawned.stop();
                Err(e)
            }
        }
    }
}

impl Drop for ProbeChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Receive Thread ─────────────────────────────────────────────────────────

/// Loss/FEC state for the current peer instance.
struct PeerLink {
    addr: SocketAddr,
    name: String,
    instance_id: u32,
    receiver: ProbeReceiver,
}

struct RxLoop {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    ingest: Sender<StatsUpdate>,
    config: EngineConfig,
    link: Option<PeerLink>,
}

impl RxLoop {
    fn run(mut self) {
        let mut buf = [0u8; 1500];
        let mut last_counter_log = Instant::now();

        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    let recv_us = self.shared.clock.now_us();
                    self.handle_datagram(&buf[..n], from, recv_us);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                // ICMP port unreachable from a peer that went away.
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!(error = %e, "recv reset");
                }
                Err(e) => {
                    error!(error = %e, "receive failed, stopping receive flow");
                    break;
                }
            }

            if last_counter_log.elapsed() >= COUNTER_LOG_INTERVAL {
                self.log_counters();
                last_counter_log = Instant::now();
            }
        }
        debug!("receive loop exited");
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, recv_us: u64) {
        let Some(frame) = Frame::decode(data) else {
            trace!(%from, len = data.len(), "malformed datagram");
            if let Some(link) = self.link.as_mut().filter(|l| l.addr == from) {
                link.receiver.record_malformed();
            }
            return;
        };

        if frame.instance_id == self.shared.instance_id {
            // Our own broadcast.
            return;
        }

        match frame.packet {
            Packet::EchoRequest(req) => self.answer_echo(&req, from, recv_us),
            Packet::EchoReply(reply) => self.absorb_echo(&reply, from, recv_us),
            Packet::Probe(probe) => {
                if self.accept_peer(from, frame.instance_id) {
                    self.handle_probe(&probe, recv_us);
                }
            }
        }
    }

    /// Bind the link to `from`, learning or replacing the peer as needed.
    /// Returns `false` for datagrams from anyone other than the peer.
    fn accept_peer(&mut self, from: SocketAddr, instance_id: u32) -> bool {
        let current = self.shared.peer.load_full();
        match current.as_deref() {
            Some(peer) if *peer != from => {
                trace!(%from, %peer, "ignoring probe from non-peer");
                return false;
            }
            Some(_) => {}
            None => {
                info!(peer = %from, "peer discovered");
                self.shared.peer.store(Some(Arc::new(from)));
            }
        }

        match &self.link {
            Some(link) if link.instance_id == instance_id => {}
            Some(link) => {
                info!(
                    peer = %from,
                    old = format_args!("{:08x}", link.instance_id),
                    new = format_args!("{:08x}", instance_id),
                    "peer restarted, resetting loss state"
                );
                self.shared.reset_sync();
                self.link = Some(self.new_link(from, instance_id));
            }
            None => self.link = Some(self.new_link(from, instance_id)),
        }
        true
    }

    fn new_link(&self, addr: SocketAddr, instance_id: u32) -> PeerLink {
        PeerLink {
            addr,
            name: addr.to_string(),
            instance_id,
            receiver: ProbeReceiver::new(
                self.config.fec.receiver_config(),
                LossSimulator::new(self.config.loss.probability, self.config.loss.seed),
            ),
        }
    }

    fn handle_probe(&mut self, probe: &ProbePacket, recv_us: u64) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let arrivals = link.receiver.receive(probe, recv_us);

        let samples: Vec<_> = {
            let sync = self.shared.sync.lock().unwrap_or_else(|e| e.into_inner());
            arrivals
                .iter()
                .filter_map(|a| a.to_sample(&link.name, &sync))
                .collect()
        };

        let loss = StatsUpdate::Loss {
            peer: link.name.clone(),
            tally: link.receiver.tally(),
        };
        for update in samples.into_iter().map(StatsUpdate::Sample).chain([loss]) {
            self.forward(update);
        }
    }

    fn forward(&self, update: StatsUpdate) {
        match self.ingest.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.ingest_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn answer_echo(&self, req: &EchoRequest, from: SocketAddr, recv_us: u64) {
        let reply = ClockSync::make_reply(req, recv_us, self.shared.clock.now_us());
        let bytes = Frame::new(self.shared.instance_id, Packet::EchoReply(reply)).encode();
        if let Err(e) = self.socket.send_to(&bytes, from) {
            debug!(%from, error = %e, "echo reply send failed");
        }
    }

    fn absorb_echo(&self, reply: &EchoReply, from: SocketAddr, recv_us: u64) {
        if self.shared.peer.load().as_deref() != Some(&from) {
            return;
        }
        let mut sync = self.shared.sync.lock().unwrap_or_else(|e| e.into_inner());
        let first = !sync.is_synchronized();
        if let Some(sample_us) = sync.handle_reply(reply, recv_us) {
            if first {
                info!(peer = %from, offset_us = sample_us, "clock synchronized");
            }
            trace!(
                offset_us = sample_us,
                srtt_us = sync.srtt_us(),
                "clock sample"
            );
        }
    }

    fn log_counters(&self) {
        let Some(link) = &self.link else {
            return;
        };
        let c = link.receiver.counters();
        let tally = link.receiver.tally();
        let sync = self.shared.sync.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            peer = %link.name,
            expected = tally.expected,
            received = tally.received,
            recovered = tally.recovered,
            simulated_drops = c.simulated_drops,
            malformed = c.malformed,
            duplicates = c.duplicates,
            stale = c.stale,
            mismatched_parity = c.mismatched_parity,
            unrecoverable_blocks = link.receiver.unrecoverable_blocks(),
            offset_us = ?sync.offset_us(),
            srtt_us = sync.srtt_us(),
            min_rtt_us = ?sync.min_rtt_us(),
            ingest_dropped = self.shared.ingest_dropped.load(Ordering::Relaxed),
            "receiver counters"
        );
    }
}

// ─── Send Thread ────────────────────────────────────────────────────────────

struct TxLoop {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    broadcast: bool,
    port: u16,
    sender: ProbeSender,
    interval: Duration,
    echo_interval: Duration,
}

impl TxLoop {
    fn run(mut self, stop: Receiver<()>) {
        let probes = tick(self.interval);
        let echoes = tick(self.echo_interval);
        let mut buf = Vec::with_capacity(FRAME_LEN * 2);

        loop {
            select! {
                recv(stop) -> _ => break,
                recv(probes) -> _ => self.send_probe(&mut buf),
                recv(echoes) -> _ => self.send_echo(),
            }
        }
        let stats = self.sender.stats();
        debug!(
            probes = stats.probes_sent,
            parity = stats.parity_sent,
            redundancy = format_args!("{:.3}", stats.redundancy_ratio()),
            "send loop exited"
        );
    }

    /// Unicast to the peer, or broadcast while discovering.
    fn destination(&self) -> Option<SocketAddr> {
        match self.shared.peer.load_full() {
            Some(peer) => Some(*peer),
            None if self.broadcast => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                self.port,
            ))),
            None => None,
        }
    }

    fn send_probe(&mut self, buf: &mut Vec<u8>) {
        let Some(dest) = self.destination() else {
            return;
        };
        let now_us = self.shared.clock.now_us();
        for frame in self.sender.next_frames(now_us) {
            buf.clear();
            frame.encode_into(buf);
            if let Err(e) = self.socket.send_to(&buf[..], dest) {
                debug!(%dest, error = %e, "probe send failed");
            }
        }
    }

    fn send_echo(&self) {
        let Some(peer) = self.shared.peer.load_full() else {
            return;
        };
        let req = self
            .shared
            .sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .make_request(self.shared.clock.now_us());
        let bytes = Frame::new(self.shared.instance_id, Packet::EchoRequest(req)).encode();
        if let Err(e) = self.socket.send_to(&bytes, *peer) {
            debug!(peer = %peer, error = %e, "echo request send failed");
        }
    }
}

// ─── Stats Thread ───────────────────────────────────────────────────────────

fn stats_loop(
    mut aggregator: Aggregator,
    mut ingest: Receiver<StatsUpdate>,
    stop: Receiver<()>,
    publish_interval: Duration,
    publisher: &StatisticsPublisher,
) {
    let ticker = tick(publish_interval);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ingest) -> msg => match msg {
                Ok(update) => aggregator.apply(update),
                // Receive flow ended; keep republishing what we have.
                Err(_) => ingest = never(),
            },
            recv(ticker) -> _ => {
                for stats in aggregator.tick() {
                    publisher.publish(stats);
                }
            }
        }
    }
    debug!(
        peers = aggregator.peer_count(),
        samples = aggregator.samples_ingested(),
        "stats loop exited"
    );
}
