//! # Statistics Aggregator
//!
//! Owns one [`DelayWindow`] and the latest [`LossTally`] per peer name.
//! Only the stats thread touches it; everything leaving the aggregator is a
//! finished [`Statistics`] snapshot.

use std::collections::BTreeMap;

use tracing::trace;
use wlanprobe_transport::stats::{DelaySample, DelayWindow, LossTally, Statistics};

/// Message from the receive path to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsUpdate {
    Sample(DelaySample),
    /// Cumulative loss accounting for a peer; replaces the previous tally.
    Loss { peer: String, tally: LossTally },
}

#[derive(Debug)]
struct PeerWindow {
    window: DelayWindow,
    loss: LossTally,
}

pub struct Aggregator {
    window_size: usize,
    peers: BTreeMap<String, PeerWindow>,
    samples_ingested: u64,
}

impl Aggregator {
    pub fn new(window_size: usize) -> Self {
        Aggregator {
            window_size: window_size.max(1),
            peers: BTreeMap::new(),
            samples_ingested: 0,
        }
    }

    pub fn apply(&mut self, update: StatsUpdate) {
        match update {
            StatsUpdate::Sample(sample) => self.ingest(sample),
            StatsUpdate::Loss { peer, tally } => self.update_loss(&peer, tally),
        }
    }

    pub fn ingest(&mut self, sample: DelaySample) {
        trace!(peer = %sample.peer, delay_ms = sample.delay_ms, recovered = sample.recovered, "sample");
        self.samples_ingested += 1;
        let delay_ms = sample.delay_ms.max(0.0);
        self.peer_mut(sample.peer).window.push(delay_ms);
    }

    pub fn update_loss(&mut self, peer: &str, tally: LossTally) {
        match self.peers.get_mut(peer) {
            Some(p) => p.loss = tally,
            None => self.peer_mut(peer.to_string()).loss = tally,
        }
    }

    fn peer_mut(&mut self, peer: String) -> &mut PeerWindow {
        let window_size = self.window_size;
        self.peers.entry(peer).or_insert_with(|| PeerWindow {
            window: DelayWindow::new(window_size),
            loss: LossTally::default(),
        })
    }

    /// One snapshot per known peer, in name order. Peers with no new data
    /// republish their current window.
    pub fn tick(&self) -> Vec<Statistics> {
        self.peers
            .iter()
            .map(|(name, p)| p.window.summarize(name, &p.loss))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn window_len(&self, peer: &str) -> usize {
        self.peers.get(peer).map_or(0, |p| p.window.len())
    }

    pub fn samples_ingested(&self) -> u64 {
        self.samples_ingested
    }
}
