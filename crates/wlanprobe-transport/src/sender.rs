//! # Probe Sender
//!
//! Numbers outgoing probes, stamps them, and interleaves one parity datagram
//! after every FEC block.

use serde::Serialize;

use crate::codec::FecEncoder;
use crate::wire::{Frame, Packet, ProbePacket};

/// Sender-side counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SenderStats {
    pub probes_sent: u64,
    pub parity_sent: u64,
}

impl SenderStats {
    /// Parity datagrams per probe.
    pub fn redundancy_ratio(&self) -> f64 {
        if self.probes_sent == 0 {
            0.0
        } else {
            self.parity_sent as f64 / self.probes_sent as f64
        }
    }
}

/// Produces the probe stream for one endpoint.
pub struct ProbeSender {
    instance_id: u32,
    next_sequence: u64,
    encoder: FecEncoder,
    stats: SenderStats,
}

impl ProbeSender {
    pub fn new(instance_id: u32, fec_block_size: usize) -> Self {
        ProbeSender {
            instance_id,
            next_sequence: 0,
            encoder: FecEncoder::new(fec_block_size),
            stats: SenderStats::default(),
        }
    }

    /// Frames to transmit for the next probe tick: the probe itself, then
    /// the block parity when this probe completes a block.
    pub fn next_frames(&mut self, now_us: u64) -> Vec<Frame> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let mut frames = Vec::with_capacity(2);
        frames.push(Frame::new(
            self.instance_id,
            Packet::Probe(ProbePacket::new(sequence, now_us)),
        ));
        self.stats.probes_sent += 1;

        if let Some(parity) = self.encoder.add_probe(sequence, now_us) {
            frames.push(Frame::new(
                self.instance_id,
                Packet::Probe(ProbePacket::parity(
                    parity.block_start,
                    now_us,
                    parity.redundancy,
                )),
            ));
            self.stats.parity_sent += 1;
        }

        frames
    }

    /// Sequence number the next probe will carry.
    #[cfg(test)]
    fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PacketKind;

    #[test]
    fn parity_follows_every_block() {
        let mut tx = ProbeSender::new(9, 4);
        let kinds: Vec<PacketKind> = (0..8u64)
            .flat_map(|i| tx.next_frames(i * 1000))
            .map(|f| f.packet.kind())
            .collect();
        assert_eq!(kinds.len(), 10);
        assert_eq!(kinds[4], PacketKind::Parity);
        assert_eq!(kinds[9], PacketKind::Parity);
        assert_eq!(tx.stats().probes_sent, 8);
        assert_eq!(tx.stats().parity_sent, 2);
        assert!((tx.stats().redundancy_ratio() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn sequences_are_consecutive_and_tagged() {
        let mut tx = ProbeSender::new(0xABCD, 8);
        for expected in 0..20u64 {
            let frames = tx.next_frames(expected);
            assert_eq!(frames[0].instance_id, 0xABCD);
            match frames[0].packet {
                Packet::Probe(p) => {
                    assert_eq!(p.sequence, expected);
                    assert!(!p.is_parity());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(tx.next_sequence(), 20);
    }

    #[test]
    fn parity_protects_its_block() {
        let mut tx = ProbeSender::new(1, 4);
        let mut xor = 0;
        let mut parity = None;
        for i in 0..4u64 {
            let ts = 500 + i * 17;
            xor ^= ts;
            for f in tx.next_frames(ts) {
                if let Packet::Probe(p) = f.packet {
                    if p.is_parity() {
                        parity = Some(p);
                    }
                }
            }
        }
        let parity = parity.unwrap();
        assert_eq!(parity.sequence, 0);
        assert_eq!(parity.redundancy.unwrap().parity_us, xor);
    }
}
