//! # Statistics Publisher
//!
//! Fans each [`Statistics`] snapshot out to registered observers, then
//! stores it in the [`StatsRegistry`] under its peer name.
//!
//! Observers run synchronously on the stats thread. The observer list is
//! copied out under its lock before any callback runs, and each callback is
//! isolated so one panicking observer does not starve the rest.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{info, warn};
use wlanprobe_transport::stats::Statistics;

/// Receives every published snapshot. Must return quickly.
pub trait StatisticsObserver: Send + Sync {
    fn on_statistics(&self, stats: &Statistics);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

// ─── Registry ───────────────────────────────────────────────────────────────

/// Latest snapshot per peer name, behind one lock.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    inner: Mutex<HashMap<String, Statistics>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, stats: Statistics) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(stats.name.clone(), stats);
    }

    pub fn get(&self, name: &str) -> Option<Statistics> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// All snapshots, sorted by name.
    pub fn snapshot(&self) -> Vec<Statistics> {
        let mut all: Vec<Statistics> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Publisher ──────────────────────────────────────────────────────────────

type ObserverList = Vec<(ObserverId, Arc<dyn StatisticsObserver>)>;

pub struct StatisticsPublisher {
    observers: Mutex<ObserverList>,
    next_id: AtomicU64,
    registry: Arc<StatsRegistry>,
    published: AtomicU64,
    observer_faults: AtomicU64,
}

impl StatisticsPublisher {
    pub fn new(registry: Arc<StatsRegistry>) -> Self {
        StatisticsPublisher {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            registry,
            published: AtomicU64::new(0),
            observer_faults: AtomicU64::new(0),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn StatisticsObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, observer));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn publish(&self, stats: Statistics) {
        let observers: Vec<Arc<dyn StatisticsObserver>> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        for observer in observers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| observer.on_statistics(&stats)));
            if outcome.is_err() {
                self.observer_faults.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %stats.name, "statistics observer panicked");
            }
        }

        self.registry.store(stats);
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registry(&self) -> &Arc<StatsRegistry> {
        &self.registry
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn observer_faults(&self) -> u64 {
        self.observer_faults.load(Ordering::Relaxed)
    }
}

// ─── Observers ──────────────────────────────────────────────────────────────

/// Hands snapshots to another thread through a bounded queue. Never blocks;
/// snapshots are dropped while the queue is full.
pub struct QueueObserver {
    tx: Sender<Statistics>,
    dropped: AtomicU64,
}

impl QueueObserver {
    pub fn new(capacity: usize) -> (Self, Receiver<Statistics>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            QueueObserver {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StatisticsObserver for QueueObserver {
    fn on_statistics(&self, stats: &Statistics) {
        match self.tx.try_send(stats.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Logs each snapshot at info level.
#[derive(Debug, Default)]
pub struct LogObserver;

impl StatisticsObserver for LogObserver {
    fn on_statistics(&self, s: &Statistics) {
        let p = &s.percentiles;
        info!(
            peer = %s.name,
            min_ms = format_args!("{:.3}", s.min),
            avg_ms = format_args!("{:.3}", s.average),
            max_ms = format_args!("{:.3}", s.max),
            stddev_ms = format_args!("{:.3}", s.standard_deviation),
            p10 = format_args!("{:.3}", p[1]),
            p20 = format_args!("{:.3}", p[2]),
            p50 = format_args!("{:.3}", s.median()),
            p80 = format_args!("{:.3}", p[8]),
            p90 = format_args!("{:.3}", p[9]),
            wire_plr = format_args!("{:.2}%", s.wire_plr),
            effective_plr = format_args!("{:.2}%", s.effective_plr),
            "one-way delay"
        );
    }
}
