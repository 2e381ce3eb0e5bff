//! Simulated wire loss.
//!
//! Every arriving datagram gets one independent Bernoulli draw from a seeded
//! generator, so a fixed seed and a fixed arrival order always drop the same
//! datagrams.

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;

/// Default simulated loss probability (3%).
pub const DEFAULT_LOSS_PROBABILITY: f64 = 0.03;

/// Seeded drop decision for arriving datagrams.
#[derive(Debug)]
pub struct LossSimulator {
    probability: f64,
    rng: StdRng,
    seen: u64,
    dropped: u64,
}

impl LossSimulator {
    /// `probability` is clamped to `[0, 1]`.
    pub fn new(probability: f64, seed: u64) -> Self {
        let probability = if probability.is_finite() {
            probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        LossSimulator {
            probability,
            rng: StdRng::seed_from_u64(seed),
            seen: 0,
            dropped: 0,
        }
    }

    /// Simulator that never drops.
    pub fn disabled() -> Self {
        Self::new(0.0, 0)
    }

    /// Decide the fate of the next datagram. `true` means drop it.
    pub fn should_drop(&mut self) -> bool {
        self.seen += 1;
        // Draw even at 0% so the drop pattern for a seed does not depend on
        // whether loss was enabled for earlier datagrams.
        let roll = self.rng.random::<f64>();
        let drop = roll < self.probability;
        if drop {
            self.dropped += 1;
        }
        drop
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Datagrams judged so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Datagrams dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
