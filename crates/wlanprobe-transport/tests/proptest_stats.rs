//! Property-based tests for the sliding delay window and its summary.

use proptest::prelude::*;
use wlanprobe_transport::stats::{DelayWindow, LossTally, Welford, PERCENTILE_COUNT};

fn delays() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(0.0f64..5_000.0, 0..400)
}

proptest! {
    /// Percentiles are ordered and bracketed by Min and Max.
    #[test]
    fn summary_is_ordered(samples in delays(), capacity in 1usize..300) {
        let mut window = DelayWindow::new(capacity);
        for s in &samples {
            window.push(*s);
        }
        let stats = window.summarize("p", &LossTally::default());

        if window.is_empty() {
            prop_assert_eq!(stats.percentiles, [0.0; PERCENTILE_COUNT]);
            prop_assert_eq!(stats.min, 0.0);
            prop_assert_eq!(stats.max, 0.0);
            return Ok(());
        }

        prop_assert_eq!(stats.percentiles[0], stats.min);
        prop_assert_eq!(stats.percentiles[10], stats.max);
        for pair in stats.percentiles.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
        prop_assert!(stats.min <= stats.average + 1e-9);
        prop_assert!(stats.average <= stats.max + 1e-9);
        prop_assert!(stats.standard_deviation >= 0.0);
        for s in window.iter() {
            prop_assert!(stats.min <= *s && *s <= stats.max);
        }
    }

    /// The window always holds the newest `min(n, capacity)` samples.
    #[test]
    fn window_keeps_newest(samples in delays(), capacity in 1usize..300) {
        let mut window = DelayWindow::new(capacity);
        for s in &samples {
            window.push(*s);
        }
        let keep = samples.len().min(capacity);
        prop_assert_eq!(window.len(), keep);
        let tail = &samples[samples.len() - keep..];
        prop_assert!(window.iter().copied().eq(tail.iter().copied()));
    }

    /// Average and population deviation match a two-pass computation.
    #[test]
    fn moments_match_two_pass(samples in proptest::collection::vec(0.0f64..1_000.0, 1..300)) {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

        let w: Welford = samples.iter().copied().collect();
        prop_assert!((w.mean() - mean).abs() < 1e-6);
        prop_assert!((w.population_std_dev() - var.sqrt()).abs() < 1e-6);
    }

    /// PLR values stay in [0, 100] and effective never exceeds wire.
    #[test]
    fn plr_bounds(expected in 0u64..10_000, received in 0u64..10_000, recovered in 0u64..10_000) {
        let received = received.min(expected);
        let recovered = recovered.min(expected - received);
        let tally = LossTally { expected, received, recovered };
        prop_assert!((0.0..=100.0).contains(&tally.wire_plr()));
        prop_assert!((0.0..=100.0).contains(&tally.effective_plr()));
        prop_assert!(tally.effective_plr() <= tally.wire_plr());
    }
}

#[test]
fn single_sample_fills_every_percentile() {
    let mut window = DelayWindow::new(10);
    window.push(4.25);
    let stats = window.summarize("solo", &LossTally::default());
    assert_eq!(stats.percentiles, [4.25; PERCENTILE_COUNT]);
    assert_eq!(stats.standard_deviation, 0.0);
    assert_eq!(stats.average, 4.25);
}
