//! # Delay Statistics
//!
//! Bounded sliding window of one-way-delay samples and the [`Statistics`]
//! snapshot computed from it. Snapshots serialize with the field names UI
//! and logging collaborators expect (`Name`, `Min`, ..., `EffectivePLR`).

use std::collections::VecDeque;

use serde::Serialize;

/// Number of percentile points: 0%, 10%, ..., 100%.
pub const PERCENTILE_COUNT: usize = 11;

// ─── Delay Sample ───────────────────────────────────────────────────────────

/// One corrected one-way-delay measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DelaySample {
    /// Connection the probe arrived on.
    pub peer: String,
    /// One-way delay in milliseconds, never negative.
    pub delay_ms: f64,
    /// Reconstructed by FEC rather than received directly.
    pub recovered: bool,
}

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Latest summary for one peer connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    #[serde(rename = "Name")]
    pub name: String,
    /// Milliseconds.
    #[serde(rename = "Min")]
    pub min: f64,
    #[serde(rename = "Max")]
    pub max: f64,
    #[serde(rename = "Average")]
    pub average: f64,
    #[serde(rename = "StandardDeviation")]
    pub standard_deviation: f64,
    /// Index `i` holds the `10 * i` percentile.
    #[serde(rename = "Percentiles")]
    pub percentiles: [f64; PERCENTILE_COUNT],
    /// Percent of probes lost before FEC.
    #[serde(rename = "WirePLR")]
    pub wire_plr: f64,
    /// Percent of probes still missing after FEC.
    #[serde(rename = "EffectivePLR")]
    pub effective_plr: f64,
}

impl Statistics {
    /// All-zero statistics for a connection with no samples yet.
    pub fn empty(name: impl Into<String>) -> Self {
        Statistics {
            name: name.into(),
            min: 0.0,
            max: 0.0,
            average: 0.0,
            standard_deviation: 0.0,
            percentiles: [0.0; PERCENTILE_COUNT],
            wire_plr: 0.0,
            effective_plr: 0.0,
        }
    }

    /// Median one-way delay.
    pub fn median(&self) -> f64 {
        self.percentiles[5]
    }
}

// ─── Loss Tally ─────────────────────────────────────────────────────────────

/// Probe accounting for one peer, as reported by the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossTally {
    /// Probes expected from sequence continuity.
    pub expected: u64,
    /// Probes that arrived and survived simulated loss.
    pub received: u64,
    /// Lost probes rebuilt from parity.
    pub recovered: u64,
}

impl LossTally {
    pub fn wire_lost(&self) -> u64 {
        self.expected.saturating_sub(self.received)
    }

    pub fn unrecovered(&self) -> u64 {
        self.wire_lost().saturating_sub(self.recovered)
    }

    /// Loss before recovery, percent.
    pub fn wire_plr(&self) -> f64 {
        percent(self.wire_lost(), self.expected)
    }

    /// Loss after recovery, percent.
    pub fn effective_plr(&self) -> f64 {
        percent(self.unrecovered(), self.expected)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

// ─── Delay Window ───────────────────────────────────────────────────────────

/// Fixed-capacity window of the most recent delay samples.
#[derive(Debug, Clone)]
pub struct DelayWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl DelayWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be > 0");
        DelayWindow {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&mut self, delay_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(delay_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }

    /// Compute a snapshot of the current window combined with `loss`.
    pub fn summarize(&self, name: &str, loss: &LossTally) -> Statistics {
        let mut stats = Statistics::empty(name);
        stats.wire_plr = loss.wire_plr();
        stats.effective_plr = loss.effective_plr();

        if self.samples.is_empty() {
            return stats;
        }

        let moments = Welford::from_iter(self.samples.iter().copied());
        stats.min = moments.min;
        stats.max = moments.max;
        stats.average = moments.mean;
        stats.standard_deviation = moments.population_std_dev();
        stats.percentiles = self.percentiles();
        stats
    }

    /// 11-point percentile summary at indices `round(p/10 * (n - 1))`.
    pub fn percentiles(&self) -> [f64; PERCENTILE_COUNT] {
        let mut out = [0.0; PERCENTILE_COUNT];
        match self.samples.len() {
            0 => return out,
            1 => return [self.samples[0]; PERCENTILE_COUNT],
            _ => {}
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_unstable_by(f64::total_cmp);

        let last = (sorted.len() - 1) as f64;
        for (p, slot) in out.iter_mut().enumerate() {
            let idx = (p as f64 / 10.0 * last).round() as usize;
            *slot = sorted[idx.min(sorted.len() - 1)];
        }
        out
    }
}

// ─── Welford ────────────────────────────────────────────────────────────────

/// Single-pass mean/variance accumulator (Welford's online algorithm).
#[derive(Debug, Clone, Copy)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Welford {
    pub fn new() -> Self {
        Welford {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn population_variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn population_std_dev(&self) -> f64 {
        self.population_variance().sqrt()
    }
}

impl Default for Welford {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<f64> for Welford {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut w = Welford::new();
        for x in iter {
            w.push(x);
        }
        w
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    /// Create a new EWMA with the given smoothing factor.
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Reset to uninitialized state.
    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
