//! # FEC Codec: XOR Parity Blocks
//!
//! Systematic single-erasure code over blocks of K consecutive probes.
//!
//! - Probes are sent unencoded. Block `b` covers sequences `b*K .. b*K + K`.
//! - After the K-th probe of a block the sender emits one parity datagram
//!   holding the XOR of the block's send timestamps.
//! - Any single loss among the K + 1 datagrams of a block is recoverable:
//!   the missing timestamp is `parity ^ xor(received timestamps)`.
//! - Two or more losses in a block are unrecoverable.

use std::collections::BTreeMap;

use crate::wire::Redundancy;

/// Largest supported block: the receive mask is a `u64`.
pub const MAX_BLOCK_SIZE: usize = 64;

/// Smallest useful block.
pub const MIN_BLOCK_SIZE: usize = 2;

fn block_mask(k: usize) -> u64 {
    if k >= 64 {
        u64::MAX
    } else {
        (1u64 << k) - 1
    }
}

// ─── FEC Encoder ─────────────────────────────────────────────────────────

/// Parity emitted when a block completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityBlock {
    /// First sequence number of the protected block.
    pub block_start: u64,
    pub redundancy: Redundancy,
}

/// Accumulates send timestamps and emits one parity per K probes.
pub struct FecEncoder {
    block_size: usize,
    /// Block currently being filled.
    block_index: u64,
    filled: usize,
    parity_us: u64,
}

impl FecEncoder {
    /// Create an encoder for blocks of `k` probes.
    pub fn new(k: usize) -> Self {
        assert!(
            (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&k),
            "FEC block size must be in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"
        );
        FecEncoder {
            block_size: k,
            block_index: 0,
            filled: 0,
            parity_us: 0,
        }
    }

    /// Feed a probe. Sequences must be consecutive starting at a block
    /// boundary. Returns the parity once the block is complete.
    pub fn add_probe(&mut self, sequence: u64, send_us: u64) -> Option<ParityBlock> {
        let index = sequence / self.block_size as u64;
        if index != self.block_index {
            // Sequence jumped to another block; restart accumulation there.
            self.block_index = index;
            self.filled = 0;
            self.parity_us = 0;
        }

        self.parity_us ^= send_us;
        self.filled += 1;

        if self.filled < self.block_size {
            return None;
        }

        let parity = ParityBlock {
            block_start: index * self.block_size as u64,
            redundancy: Redundancy {
                block_len: self.block_size as u8,
                parity_us: self.parity_us,
            },
        };
        self.block_index = index + 1;
        self.filled = 0;
        self.parity_us = 0;
        Some(parity)
    }

    /// Probes accumulated in the current, incomplete block.
    #[cfg(test)]
    fn buffered_count(&self) -> usize {
        self.filled
    }
}

// ─── FEC Decoder ─────────────────────────────────────────────────────────

/// A probe rebuilt from parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredProbe {
    pub sequence: u64,
    /// Sender clock, µs.
    pub send_us: u64,
}

/// Why the decoder refused a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Already received or recovered.
    Duplicate,
    /// Belongs to a block that has been evicted.
    Stale,
    /// Parity with a block length or start that does not match this decoder.
    Mismatch,
}

#[derive(Debug, Default)]
struct BlockState {
    /// Bit `i` set once probe `block_start + i` is held.
    have: u64,
    xor_us: u64,
    parity_us: Option<u64>,
    recovered: bool,
}

/// Per-peer decoder tracking a bounded number of recent blocks.
pub struct FecDecoder {
    block_size: usize,
    max_blocks: usize,
    blocks: BTreeMap<u64, BlockState>,
    /// Blocks below this index are gone.
    floor: u64,
    unrecoverable_blocks: u64,
}

impl FecDecoder {
    pub fn new(k: usize, max_blocks: usize) -> Self {
        assert!(
            (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&k),
            "FEC block size must be in {MIN_BLOCK_SIZE}..={MAX_BLOCK_SIZE}"
        );
        assert!(max_blocks > 0, "must track at least one block");
        FecDecoder {
            block_size: k,
            max_blocks,
            blocks: BTreeMap::new(),
            floor: 0,
            unrecoverable_blocks: 0,
        }
    }

    /// Record a directly received probe.
    pub fn add_source(
        &mut self,
        sequence: u64,
        send_us: u64,
    ) -> Result<Option<RecoveredProbe>, Rejected> {
        let k = self.block_size as u64;
        let index = sequence / k;
        let bit = 1u64 << (sequence % k);

        let block = self.block_mut(index).ok_or(Rejected::Stale)?;
        if block.have & bit != 0 {
            return Err(Rejected::Duplicate);
        }
        block.have |= bit;
        block.xor_us ^= send_us;

        Ok(self.try_recover(index))
    }

    /// Record a parity datagram for the block starting at `block_start`.
    pub fn add_parity(
        &mut self,
        block_start: u64,
        redundancy: &Redundancy,
    ) -> Result<Option<RecoveredProbe>, Rejected> {
        let k = self.block_size as u64;
        if redundancy.block_len as u64 != k || block_start % k != 0 {
            return Err(Rejected::Mismatch);
        }
        let index = block_start / k;

        let block = self.block_mut(index).ok_or(Rejected::Stale)?;
        if block.parity_us.is_some() {
            return Err(Rejected::Duplicate);
        }
        block.parity_us = Some(redundancy.parity_us);

        Ok(self.try_recover(index))
    }

    /// Recover the single missing probe of block `index` if possible.
    fn try_recover(&mut self, index: u64) -> Option<RecoveredProbe> {
        let full = block_mask(self.block_size);
        let k = self.block_size as u64;
        let block = self.blocks.get_mut(&index)?;

        if block.recovered {
            return None;
        }
        let parity = block.parity_us?;
        let missing = full & !block.have;
        if missing.count_ones() != 1 {
            return None;
        }

        let offset = missing.trailing_zeros() as u64;
        block.have |= missing;
        block.recovered = true;
        Some(RecoveredProbe {
            sequence: index * k + offset,
            send_us: parity ^ block.xor_us,
        })
    }

    /// Get or create block state, evicting blocks that fall out of range.
    fn block_mut(&mut self, index: u64) -> Option<&mut BlockState> {
        if index < self.floor {
            return None;
        }

        let newest = self.blocks.keys().next_back().copied().unwrap_or(index);
        if index > newest {
            let keep_from = (index + 1).saturating_sub(self.max_blocks as u64);
            self.evict_below(keep_from);
        }

        Some(self.blocks.entry(index).or_default())
    }

    fn evict_below(&mut self, keep_from: u64) {
        if keep_from <= self.floor {
            return;
        }
        let full = block_mask(self.block_size);
        let kept = self.blocks.split_off(&keep_from);
        let evicted = std::mem::replace(&mut self.blocks, kept);
        self.unrecoverable_blocks += evicted
            .values()
            .filter(|b| (full & !b.have).count_ones() > 1)
            .count() as u64;
        self.floor = keep_from;
    }

    /// Blocks currently tracked.
    #[cfg(test)]
    fn tracked_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Evicted blocks that still had two or more probes missing.
    pub fn unrecoverable_blocks(&self) -> u64 {
        self.unrecoverable_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_block(k: usize, block: u64) -> (Vec<(u64, u64)>, ParityBlock) {
        let mut enc = FecEncoder::new(k);
        let mut probes = Vec::new();
        let mut parity = None;
        for i in 0..k as u64 {
            let seq = block * k as u64 + i;
            let ts = 1_000_000 + seq * 20_000 + (seq * 7919) % 1000;
            probes.push((seq, ts));
            parity = enc.add_probe(seq, ts);
        }
        (probes, parity.unwrap())
    }

    #[test]
    fn encoder_emits_once_per_block() {
        let mut enc = FecEncoder::new(4);
        let emitted: Vec<_> = (0..12u64).filter_map(|s| enc.add_probe(s, s)).collect();
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[1].block_start, 4);
        assert_eq!(emitted[1].redundancy.parity_us, 4 ^ 5 ^ 6 ^ 7);
        assert_eq!(enc.buffered_count(), 0);
    }

    #[test]
    fn encoder_resyncs_on_sequence_jump() {
        let mut enc = FecEncoder::new(4);
        enc.add_probe(0, 1);
        enc.add_probe(1, 1);
        // Jump into block 2 mid-way: the partial block 0 is abandoned.
        assert!(enc.add_probe(8, 10).is_none());
        assert_eq!(enc.buffered_count(), 1);
    }

    #[test]
    fn recovers_any_single_loss() {
        let k = 8;
        for missing in 0..k {
            let (probes, parity) = encode_block(k, 3);
            let mut dec = FecDecoder::new(k, 16);
            for (i, &(seq, ts)) in probes.iter().enumerate() {
                if i != missing {
                    assert_eq!(dec.add_source(seq, ts), Ok(None));
                }
            }
            let rec = dec
                .add_parity(parity.block_start, &parity.redundancy)
                .unwrap()
                .unwrap();
            assert_eq!(rec.sequence, probes[missing].0);
            assert_eq!(rec.send_us, probes[missing].1);
        }
    }

    #[test]
    fn parity_before_data_still_recovers() {
        let (probes, parity) = encode_block(4, 0);
        let mut dec = FecDecoder::new(4, 16);
        assert_eq!(dec.add_parity(0, &parity.redundancy), Ok(None));
        dec.add_source(probes[0].0, probes[0].1).unwrap();
        dec.add_source(probes[1].0, probes[1].1).unwrap();
        let rec = dec.add_source(probes[3].0, probes[3].1).unwrap().unwrap();
        assert_eq!(rec.sequence, 2);
        assert_eq!(rec.send_us, probes[2].1);
    }

    #[test]
    fn double_loss_is_unrecoverable() {
        let (probes, parity) = encode_block(4, 0);
        let mut dec = FecDecoder::new(4, 2);
        for &(seq, ts) in &probes[2..] {
            dec.add_source(seq, ts).unwrap();
        }
        assert_eq!(dec.add_parity(0, &parity.redundancy), Ok(None));

        // Push the block out of the window.
        dec.add_source(8, 0).unwrap();
        dec.add_source(12, 0).unwrap();
        assert_eq!(dec.unrecoverable_blocks(), 1);
    }

    #[test]
    fn complete_block_needs_no_recovery() {
        let (probes, parity) = encode_block(4, 1);
        let mut dec = FecDecoder::new(4, 16);
        for &(seq, ts) in &probes {
            dec.add_source(seq, ts).unwrap();
        }
        assert_eq!(dec.add_parity(parity.block_start, &parity.redundancy), Ok(None));
    }

    #[test]
    fn duplicates_rejected_including_late_original() {
        let (probes, parity) = encode_block(4, 0);
        let mut dec = FecDecoder::new(4, 16);
        for &(seq, ts) in &probes[1..] {
            dec.add_source(seq, ts).unwrap();
        }
        assert_eq!(
            dec.add_source(probes[1].0, probes[1].1),
            Err(Rejected::Duplicate)
        );
        assert!(dec.add_parity(0, &parity.redundancy).unwrap().is_some());
        assert_eq!(
            dec.add_parity(0, &parity.redundancy),
            Err(Rejected::Duplicate)
        );
        // The recovered probe finally shows up.
        assert_eq!(
            dec.add_source(probes[0].0, probes[0].1),
            Err(Rejected::Duplicate)
        );
    }

    #[test]
    fn stale_blocks_rejected() {
        let mut dec = FecDecoder::new(4, 2);
        dec.add_source(0, 0).unwrap();
        dec.add_source(40, 0).unwrap();
        assert_eq!(dec.add_source(1, 0), Err(Rejected::Stale));
        assert!(dec.tracked_blocks() <= 2);
    }

    #[test]
    fn mismatched_parity_rejected() {
        let mut dec = FecDecoder::new(4, 2);
        let r = Redundancy {
            block_len: 8,
            parity_us: 0,
        };
        assert_eq!(dec.add_parity(0, &r), Err(Rejected::Mismatch));
        let r = Redundancy {
            block_len: 4,
            parity_us: 0,
        };
        assert_eq!(dec.add_parity(3, &r), Err(Rejected::Mismatch));
    }

    #[test]
    fn block_of_64_uses_full_mask() {
        let (probes, parity) = encode_block(64, 0);
        let mut dec = FecDecoder::new(64, 4);
        for &(seq, ts) in &probes[..63] {
            dec.add_source(seq, ts).unwrap();
        }
        let rec = dec.add_parity(0, &parity.redundancy).unwrap().unwrap();
        assert_eq!(rec.sequence, 63);
    }
}
