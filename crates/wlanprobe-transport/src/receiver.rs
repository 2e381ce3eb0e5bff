//! # Probe Receiver
//!
//! Per-peer receive path for probe and parity datagrams:
//!
//! ```text
//!   datagram ─▶ LossSimulator ─drop─▶ (counted)
//!                    │ keep
//!                    ▼
//!               FecDecoder ─▶ direct arrival (+ recovered arrival)
//!                    │
//!                    ▼
//!            sequence continuity ─▶ LossTally (expected / received / recovered)
//! ```
//!
//! The receiver knows nothing about clocks; callers turn each
//! [`ProbeArrival`] into a [`DelaySample`] through [`ClockSync`].

use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::ClockSync;
use crate::codec::{FecDecoder, RecoveredProbe, Rejected};
use crate::loss::LossSimulator;
use crate::stats::{DelaySample, LossTally};
use crate::wire::ProbePacket;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Probes per FEC block; must match the sender.
    pub fec_block_size: usize,
    /// Blocks kept for late parity / reordering.
    pub max_tracked_blocks: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            fec_block_size: 8,
            max_tracked_blocks: 64,
        }
    }
}

// ─── Arrival ────────────────────────────────────────────────────────────────

/// A probe that made it through loss and FEC, directly or by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeArrival {
    pub sequence: u64,
    /// Sender clock, µs.
    pub send_us: u64,
    /// Local clock, µs. For recovered probes, the instant recovery happened.
    pub recv_us: u64,
    pub recovered: bool,
}

impl ProbeArrival {
    /// Corrected delay sample, or `None` before clock sync.
    pub fn to_sample(&self, peer: &str, sync: &ClockSync) -> Option<DelaySample> {
        let delay_ms = sync.one_way_delay_ms(self.send_us, self.recv_us)?;
        Some(DelaySample {
            peer: peer.to_string(),
            delay_ms,
            recovered: self.recovered,
        })
    }
}

// ─── Counters ───────────────────────────────────────────────────────────────

/// Diagnostic counters; WirePLR itself is derived from sequence continuity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverCounters {
    /// Datagrams discarded by the loss simulator (probes and parity).
    pub simulated_drops: u64,
    /// Datagrams that failed to decode, or whose sequence lies beyond the
    /// tracking window.
    pub malformed: u64,
    pub duplicates: u64,
    /// Probes for blocks already evicted.
    pub stale: u64,
    /// Parity that did not match the local block size.
    pub mismatched_parity: u64,
    pub parity_received: u64,
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Loss/FEC state for one peer connection.
pub struct ProbeReceiver {
    config: ReceiverConfig,
    loss: LossSimulator,
    decoder: FecDecoder,
    first_seq: Option<u64>,
    highest_seq: u64,
    /// Last sequence rejected as beyond the window.
    jump_candidate: Option<u64>,
    received: u64,
    recovered: u64,
    counters: ReceiverCounters,
}

impl ProbeReceiver {
    pub fn new(config: ReceiverConfig, loss: LossSimulator) -> Self {
        let decoder = FecDecoder::new(config.fec_block_size, config.max_tracked_blocks);
        ProbeReceiver {
            config,
            loss,
            decoder,
            first_seq: None,
            highest_seq: 0,
            jump_candidate: None,
            received: 0,
            recovered: 0,
            counters: ReceiverCounters::default(),
        }
    }

    /// Process one probe or parity datagram received at local time `recv_us`.
    ///
    /// Returns zero, one, or two arrivals (a probe that also completes a
    /// block recovery yields itself plus the recovered probe).
    pub fn receive(&mut self, packet: &ProbePacket, recv_us: u64) -> Vec<ProbeArrival> {
        if self.loss.should_drop() {
            self.counters.simulated_drops += 1;
            trace!(seq = packet.sequence, parity = packet.is_parity(), "simulated drop");
            return Vec::new();
        }

        let last_seq = match packet.redundancy {
            Some(redundancy) => packet
                .sequence
                .saturating_add((redundancy.block_len as u64).saturating_sub(1)),
            None => packet.sequence,
        };
        if self.beyond_window(last_seq) {
            // Two nearby sequences past the window mean the peer really moved
            // on (a long outage); a lone one is corruption.
            let resync = self
                .jump_candidate
                .is_some_and(|prev| last_seq > prev && last_seq - prev <= self.horizon());
            if !resync {
                self.jump_candidate = Some(last_seq);
                self.counters.malformed += 1;
                trace!(
                    seq = packet.sequence,
                    highest = self.highest_seq,
                    "sequence beyond tracking window"
                );
                return Vec::new();
            }
            debug!(from = self.highest_seq, to = last_seq, "sequence resync after outage");
        }
        self.jump_candidate = None;

        match packet.redundancy {
            Some(redundancy) => {
                let result = self.decoder.add_parity(packet.sequence, &redundancy);
                if result.is_ok() {
                    self.counters.parity_received += 1;
                    // Parity proves the whole block was sent.
                    if self.first_seq.is_some() {
                        self.highest_seq = self.highest_seq.max(last_seq);
                    }
                }
                self.finish(result, None, recv_us)
            }
            None => {
                let result = self.decoder.add_source(packet.sequence, packet.send_us);
                let direct = match result {
                    Ok(_) => {
                        self.note_sequence(packet.sequence);
                        self.received += 1;
                        Some(ProbeArrival {
                            sequence: packet.sequence,
                            send_us: packet.send_us,
                            recv_us,
                            recovered: false,
                        })
                    }
                    Err(_) => None,
                };
                self.finish(result, direct, recv_us)
            }
        }
    }

    fn finish(
        &mut self,
        result: Result<Option<RecoveredProbe>, Rejected>,
        direct: Option<ProbeArrival>,
        recv_us: u64,
    ) -> Vec<ProbeArrival> {
        let mut out = Vec::with_capacity(2);
        out.extend(direct);

        match result {
            Ok(Some(rec)) => {
                self.note_sequence(rec.sequence);
                self.recovered += 1;
                trace!(seq = rec.sequence, "recovered via parity");
                out.push(ProbeArrival {
                    sequence: rec.sequence,
                    send_us: rec.send_us,
                    recv_us,
                    recovered: true,
                });
            }
            Ok(None) => {}
            Err(Rejected::Duplicate) => self.counters.duplicates += 1,
            Err(Rejected::Stale) => self.counters.stale += 1,
            Err(Rejected::Mismatch) => self.counters.mismatched_parity += 1,
        }
        out
    }

    /// A sequence this far past the newest one would evict every tracked
    /// block, so it can only be corruption.
    fn beyond_window(&self, seq: u64) -> bool {
        self.first_seq.is_some() && seq > self.highest_seq.saturating_add(self.horizon())
    }

    fn horizon(&self) -> u64 {
        (self.config.max_tracked_blocks as u64).saturating_mul(self.config.fec_block_size as u64)
    }

    fn note_sequence(&mut self, seq: u64) {
        match self.first_seq {
            None => {
                self.first_seq = Some(seq);
                self.highest_seq = seq;
            }
            Some(first) => {
                if seq < first {
                    self.first_seq = Some(seq);
                }
                self.highest_seq = self.highest_seq.max(seq);
            }
        }
    }

    /// Count a datagram from this peer that failed to decode.
    pub fn record_malformed(&mut self) {
        self.counters.malformed += 1;
    }

    /// Probe accounting so far.
    pub fn tally(&self) -> LossTally {
        let expected = match self.first_seq {
            Some(first) => self.highest_seq.saturating_sub(first).saturating_add(1),
            None => 0,
        };
        LossTally {
            expected,
            received: self.received,
            recovered: self.recovered,
        }
    }

    pub fn counters(&self) -> ReceiverCounters {
        self.counters
    }

    /// Blocks evicted while still missing two or more probes.
    pub fn unrecoverable_blocks(&self) -> u64 {
        self.decoder.unrecoverable_blocks()
    }
}
