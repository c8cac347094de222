//! Per-tool latency and success tracking.
//!
//! Keeps a bounded FIFO window of successful-call durations per tool plus
//! cumulative success/failure counters. Percentiles use floor-index
//! selection over the sorted window, never interpolation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use super::types::InvocationAttempt;
use crate::config::TrackerSettings;

/// Summary statistics for one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub average_ms: f64,
    pub success_rate: f64,
    pub sample_size: usize,
}

#[derive(Debug, Default)]
struct SampleSet {
    durations: VecDeque<u64>,
    successes: u64,
    failures: u64,
}

/// Rolling per-tool performance samples.
///
/// The window for each tool is mutated under one lock, so eviction of the
/// oldest sample and insertion of the newest are a single step.
#[derive(Debug)]
pub struct PerformanceTracker {
    capacity: usize,
    min_samples: usize,
    samples: Mutex<HashMap<String, SampleSet>>,
}

impl PerformanceTracker {
    pub fn new(settings: &TrackerSettings) -> Self {
        Self {
            capacity: settings.sample_capacity.max(1),
            min_samples: settings.min_samples,
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Record the outcome of one call.
    pub fn record(&self, tool: &str, duration_ms: u64, success: bool) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let set = samples.entry(tool.to_string()).or_default();
        if success {
            if set.durations.len() == self.capacity {
                set.durations.pop_front();
            }
            set.durations.push_back(duration_ms);
            set.successes += 1;
        } else {
            set.failures += 1;
        }
    }

    /// Fold a finished invocation attempt into the statistics.
    pub fn record_attempt(&self, attempt: &InvocationAttempt) {
        self.record(&attempt.tool_name, attempt.duration_ms(), attempt.succeeded());
    }

    /// Statistics for `tool`, or `None` when fewer than the minimum samples exist.
    ///
    /// `None` means "unknown", not zero.
    pub fn stats(&self, tool: &str) -> Option<PerformanceStats> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let set = samples.get(tool)?;
        let n = set.durations.len();
        if n == 0 || n < self.min_samples {
            return None;
        }

        let mut sorted: Vec<u64> = set.durations.iter().copied().collect();
        sorted.sort_unstable();

        let total = set.successes + set.failures;
        Some(PerformanceStats {
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            average_ms: sorted.iter().sum::<u64>() as f64 / n as f64,
            success_rate: set.successes as f64 / total as f64,
            sample_size: n,
        })
    }

    /// Historical success rate regardless of the sample threshold.
    pub fn success_rate(&self, tool: &str) -> Option<f64> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let set = samples.get(tool)?;
        let total = set.successes + set.failures;
        (total > 0).then(|| set.successes as f64 / total as f64)
    }

    /// Number of durations currently in the window.
    pub fn window_len(&self, tool: &str) -> usize {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.get(tool).map_or(0, |s| s.durations.len())
    }
}

/// Value at `floor(len * p)` of a sorted, non-empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(capacity: usize) -> PerformanceTracker {
        PerformanceTracker::new(&TrackerSettings {
            sample_capacity: capacity,
            min_samples: 5,
        })
    }

    #[test]
    fn test_stats_percentiles_and_success_rate() {
        let t = tracker(100);
        for d in [100, 120, 110, 130, 125, 115] {
            t.record("jira", d, true);
        }
        t.record("jira", 30_000, false);

        let stats = t.stats("jira").unwrap();
        // sorted: [100, 110, 115, 120, 125, 130]
        assert_eq!(stats.p95_ms, 130);
        assert_eq!(stats.p50_ms, 120);
        assert_eq!(stats.sample_size, 6);
        assert!((stats.success_rate - 6.0 / 7.0).abs() < 1e-9);
        assert!((stats.average_ms - 700.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_data_below_minimum_samples() {
        let t = tracker(100);
        assert!(t.stats("confluence").is_none());
        for d in [10, 20, 30, 40] {
            t.record("confluence", d, true);
        }
        assert!(t.stats("confluence").is_none());
        t.record("confluence", 50, true);
        assert_eq!(t.stats("confluence").unwrap().sample_size, 5);
    }

    #[test]
    fn test_failures_do_not_enter_window() {
        let t = tracker(100);
        for _ in 0..10 {
            t.record("googleDrive", 5_000, false);
        }
        assert_eq!(t.window_len("googleDrive"), 0);
        assert!(t.stats("googleDrive").is_none());
        assert_eq!(t.success_rate("googleDrive"), Some(0.0));
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let t = tracker(8);
        for i in 0..50u64 {
            t.record("jira", i, true);
            assert!(t.window_len("jira") <= 8);
        }
        let stats = t.stats("jira").unwrap();
        assert_eq!(stats.sample_size, 8);
        // Only the most recent samples (42..=49) remain.
        assert_eq!(stats.p50_ms, 46);
        assert_eq!(stats.p95_ms, 49);
    }

    #[test]
    fn test_concurrent_records_keep_window_bounded() {
        let t = std::sync::Arc::new(tracker(16));
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let t = std::sync::Arc::clone(&t);
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        t.record("jira", w * 1000 + i, i % 5 != 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.window_len("jira"), 16);
        let stats = t.stats("jira").unwrap();
        assert!((stats.success_rate - 0.8).abs() < 1e-9);
    }
}
