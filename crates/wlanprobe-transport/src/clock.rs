//! # Clocks
//!
//! [`TimestampClock`] stamps outgoing probes. [`ClockSync`] estimates the
//! offset between the local clock and the peer's clock from echo exchanges so
//! that one-way delay can be computed from two independent clocks.
//!
//! With t1 (request sent, local), t2 (request received, peer), t3 (reply
//! sent, peer) and t4 (reply received, local), assuming a symmetric path:
//!
//! ```text
//!   offset (local − peer) = ((t1 − t2) + (t4 − t3)) / 2
//!   round trip            = (t4 − t1) − (t3 − t2)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use quanta::Instant;

use crate::stats::Ewma;
use crate::wire::{EchoReply, EchoRequest};

// ─── TimestampClock ─────────────────────────────────────────────────────────

/// Monotonic microsecond clock for probe timestamps.
#[derive(Clone)]
pub struct TimestampClock {
    epoch: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        TimestampClock {
            epoch: Instant::now(),
        }
    }

    /// Current timestamp in µs since this clock was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Clock Sync ─────────────────────────────────────────────────────────────

/// How long an unanswered echo request is remembered.
const PENDING_TTL: Duration = Duration::from_secs(5);

/// Default EWMA weight for new offset samples.
pub const DEFAULT_OFFSET_ALPHA: f64 = 0.125;

/// Peer clock offset estimator driven by echo request/response exchanges.
pub struct ClockSync {
    /// Outstanding requests: echo_id → local send instant.
    pending: HashMap<u64, Instant>,
    next_echo_id: u64,
    /// Smoothed offset, local minus peer, µs.
    offset: Ewma,
    /// Smoothed round trip, µs.
    rtt: Ewma,
    min_rtt_us: f64,
    sample_count: u64,
}

impl ClockSync {
    pub fn new(alpha: f64) -> Self {
        ClockSync {
            pending: HashMap::new(),
            next_echo_id: 0,
            offset: Ewma::new(alpha),
            rtt: Ewma::new(DEFAULT_OFFSET_ALPHA),
            min_rtt_us: f64::MAX,
            sample_count: 0,
        }
    }

    /// Build an echo request stamped with `now_us` and remember it.
    pub fn make_request(&mut self, now_us: u64) -> EchoRequest {
        let echo_id = self.next_echo_id;
        self.next_echo_id = self.next_echo_id.wrapping_add(1);
        self.pending.insert(echo_id, Instant::now());

        self.pending.retain(|_, t| t.elapsed() < PENDING_TTL);

        EchoRequest {
            echo_id,
            origin_us: now_us,
        }
    }

    /// Build the reply to a peer's request. `receive_us` and `transmit_us`
    /// are read from the local clock.
    pub fn make_reply(request: &EchoRequest, receive_us: u64, transmit_us: u64) -> EchoReply {
        EchoReply {
            echo_id: request.echo_id,
            origin_us: request.origin_us,
            receive_us,
            transmit_us,
        }
    }

    /// Fold a reply received at local time `now_us` into the estimate.
    ///
    /// Returns the raw offset sample in µs, or `None` when the reply does not
    /// match an outstanding request.
    pub fn handle_reply(&mut self, reply: &EchoReply, now_us: u64) -> Option<f64> {
        self.pending.remove(&reply.echo_id)?;

        let t1 = reply.origin_us as f64;
        let t2 = reply.receive_us as f64;
        let t3 = reply.transmit_us as f64;
        let t4 = now_us as f64;

        let rtt_us = ((t4 - t1) - (t3 - t2)).max(0.0);
        let sample = ((t1 - t2) + (t4 - t3)) / 2.0;

        self.offset.update(sample);
        self.rtt.update(rtt_us);
        self.min_rtt_us = self.min_rtt_us.min(rtt_us);
        self.sample_count += 1;

        Some(sample)
    }

    /// Seed the estimate directly, e.g. when both ends share a clock.
    pub fn set_offset_us(&mut self, offset_us: f64) {
        self.offset.reset();
        self.offset.update(offset_us);
        self.sample_count = self.sample_count.max(1);
    }

    /// Smoothed offset (local − peer) in µs, once at least one sample exists.
    pub fn offset_us(&self) -> Option<f64> {
        if self.sample_count == 0 {
            None
        } else {
            Some(self.offset.value())
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.sample_count > 0
    }

    /// Corrected one-way delay in milliseconds for a probe sent at `send_us`
    /// (peer clock) and received at `recv_us` (local clock).
    ///
    /// Negative results from estimation error clamp to zero. `None` until the
    /// first offset sample.
    pub fn one_way_delay_ms(&self, send_us: u64, recv_us: u64) -> Option<f64> {
        let offset = self.offset_us()?;
        let owd_us = recv_us as f64 - send_us as f64 - offset;
        Some(owd_us.max(0.0) / 1000.0)
    }

    /// Smoothed round trip in µs.
    pub fn srtt_us(&self) -> f64 {
        self.rtt.value()
    }

    /// Smallest round trip seen, once a reply has been folded in.
    pub fn min_rtt_us(&self) -> Option<f64> {
        (self.min_rtt_us < f64::MAX).then_some(self.min_rtt_us)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(DEFAULT_OFFSET_ALPHA)
    }
}
