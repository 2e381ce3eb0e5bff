//! # Scenario tests: Sender → wire → Receiver → ClockSync → DelayWindow
//!
//! No socket I/O; datagrams are passed as `Bytes` between the two halves.
//! Each test runs the full per-peer pipeline the engine uses and checks the
//! resulting `Statistics`.

use wlanprobe_transport::clock::ClockSync;
use wlanprobe_transport::loss::LossSimulator;
use wlanprobe_transport::receiver::{ProbeReceiver, ReceiverConfig};
use wlanprobe_transport::sender::ProbeSender;
use wlanprobe_transport::stats::{DelayWindow, Statistics, Welford};
use wlanprobe_transport::wire::{Frame, Packet};

// ─── Helpers ────────────────────────────────────────────────────────────────

const PEER: &str = "peer-a";

/// Peer clock runs this far ahead of the local clock.
const SKEW_US: u64 = 7_000_000;

struct Pipeline {
    tx: ProbeSender,
    rx: ProbeReceiver,
    sync: ClockSync,
    window: DelayWindow,
}

impl Pipeline {
    fn new(k: usize, loss: LossSimulator, window: usize) -> Self {
        let mut sync = ClockSync::default();
        // local − peer
        sync.set_offset_us(-(SKEW_US as f64));
        Pipeline {
            tx: ProbeSender::new(0xA, k),
            rx: ProbeReceiver::new(
                ReceiverConfig {
                    fec_block_size: k,
                    max_tracked_blocks: 64,
                },
                loss,
            ),
            sync,
            window: DelayWindow::new(window),
        }
    }

    /// Send one probe tick at local time `t_us` with one-way delay
    /// `delay_us`; `lose` filters datagrams by sequence
    /// and their kind (parity or not).
    fn tick(&mut self, t_us: u64, delay_us: u64, mut lose: impl FnMut(u64, bool) -> bool) {
        for frame in self.tx.next_frames(t_us + SKEW_US) {
            let bytes = frame.encode();
            let Some(Frame {
                packet: Packet::Probe(p),
                ..
            }) = Frame::decode(bytes)
            else {
                panic!("sender produced a non-probe frame");
            };
            if lose(p.sequence, p.is_parity()) {
                continue;
            }
            for arrival in self.rx.receive(&p, t_us + delay_us) {
                if let Some(sample) = arrival.to_sample(PEER, &self.sync) {
                    self.window.push(sample.delay_ms);
                }
            }
        }
    }

    fn stats(&self) -> Statistics {
        self.window.summarize(PEER, &self.rx.tally())
    }
}

/// Deterministic pseudo-jitter in [0, 4000) µs.
fn jitter_us(i: u64) -> u64 {
    (i.wrapping_mul(2_654_435_761) >> 7) % 4_000
}

// ─── Zero Loss ──────────────────────────────────────────────────────────────

#[test]
fn two_peers_zero_loss_matches_injected_delays() {
    let mut pipe = Pipeline::new(8, LossSimulator::disabled(), 1000);
    let mut injected = Welford::new();

    for i in 0..1000u64 {
        let delay_us = 5_000 + jitter_us(i);
        injected.push(delay_us as f64 / 1000.0);
        pipe.tick(i * 20_000, delay_us, |_, _| false);
    }

    let stats = pipe.stats();
    assert_eq!(stats.name, PEER);
    assert_eq!(stats.wire_plr, 0.0);
    assert_eq!(stats.effective_plr, 0.0);
    assert!((stats.average - injected.mean()).abs() < 1e-6);
    assert!((stats.standard_deviation - injected.population_std_dev()).abs() < 1e-6);
    assert!(stats.min >= 5.0 && stats.max < 9.0);
}

// ─── Single Loss Per Block ──────────────────────────────────────────────────

#[test]
fn one_loss_per_block_fully_recovered() {
    let k = 8u64;
    let mut pipe = Pipeline::new(k as usize, LossSimulator::disabled(), 1000);

    // Drop the probe at position 3 of every block; parity always arrives.
    for i in 0..800u64 {
        pipe.tick(i * 20_000, 2_000, |seq, parity| !parity && seq % k == 3);
    }

    let stats = pipe.stats();
    assert!(
        (stats.wire_plr - 100.0 / k as f64).abs() < 1e-9,
        "wire = {}",
        stats.wire_plr
    );
    assert_eq!(stats.effective_plr, 0.0);
    // Recovered probes are measured when their parity lands (later than 2 ms).
    assert!(stats.max > stats.min);
    assert!(stats.min >= 2.0 - 1e-9);
}

// ─── Double Loss In One Block ───────────────────────────────────────────────

#[test]
fn double_loss_in_one_block_is_unrecoverable() {
    let k = 10u64;
    let blocks = 50u64;
    let mut pipe = Pipeline::new(k as usize, LossSimulator::disabled(), 1000);

    // Block 7 loses probes 2 and 5; every other block loses only probe 4.
    for i in 0..blocks * k {
        pipe.tick(i * 20_000, 1_000, |seq, parity| {
            if parity {
                return false;
            }
            let (b, j) = (seq / k, seq % k);
            if b == 7 {
                j == 2 || j == 5
            } else {
                j == 4
            }
        });
    }

    let stats = pipe.stats();
    let expected = (blocks * k) as f64;
    let wire_lost = (blocks - 1) + 2;
    assert!((stats.wire_plr - wire_lost as f64 / expected * 100.0).abs() < 1e-9);
    // Only block 7's two probes stay missing: 2 / (blocks * k).
    assert!((stats.effective_plr - 2.0 / expected * 100.0).abs() < 1e-9);
    assert!(stats.effective_plr < stats.wire_plr);
}

#[test]
fn lost_parity_leaves_single_loss_unrecovered() {
    let k = 4u64;
    let mut pipe = Pipeline::new(k as usize, LossSimulator::disabled(), 100);
    for i in 0..k {
        // Probe 1 and the parity both vanish.
        pipe.tick(i * 20_000, 1_000, |seq, parity| parity || seq == 1);
    }
    let stats = pipe.stats();
    assert!((stats.wire_plr - 25.0).abs() < 1e-9);
    assert!((stats.effective_plr - 25.0).abs() < 1e-9);
}

// ─── Simulated Loss ─────────────────────────────────────────────────────────

#[test]
fn simulated_three_percent_converges() {
    let k = 8;
    let mut pipe = Pipeline::new(k, LossSimulator::new(0.03, 0x5EED), 1000);
    for i in 0..100_000u64 {
        pipe.tick(i * 1_000, 3_000, |_, _| false);
    }
    let stats = pipe.stats();
    assert!(
        (2.8..=3.2).contains(&stats.wire_plr),
        "wire PLR {} outside [2.8, 3.2]",
        stats.wire_plr
    );
    assert!(stats.effective_plr <= stats.wire_plr);
    // Single-erasure parity should mask most isolated losses at 3%.
    assert!(stats.effective_plr < stats.wire_plr / 2.0);
}

#[test]
fn same_seed_same_statistics() {
    let run = || {
        let mut pipe = Pipeline::new(8, LossSimulator::new(0.1, 99), 500);
        for i in 0..5_000u64 {
            pipe.tick(i * 1_000, 1_000 + jitter_us(i), |_, _| false);
        }
        pipe.stats()
    };
    assert_eq!(run(), run());
}

#[test]
fn window_stays_bounded() {
    let mut pipe = Pipeline::new(8, LossSimulator::disabled(), 64);
    for i in 0..10_000u64 {
        pipe.tick(i * 1_000, 1_000, |_, _| false);
    }
    assert_eq!(pipe.window.len(), 64);
    assert_eq!(pipe.window.capacity(), 64);
}
