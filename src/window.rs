//! Sliding time window over timestamped samples.
//!
//! Samples older than the window span are dropped lazily on every read or write. The window also
//! keeps at most `max_samples` entries so a burst cannot grow it without bound; when full, the
//! oldest sample is evicted first.
//!
//! The health checker keeps two of these: one of latencies in milliseconds and one of outcomes
//! (`1.0` for an error, `0.0` for a success), whose mean is the error rate.

use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_MAX_SAMPLES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    at_ms: u64,
    value: f64,
}

/// Bounded-duration buffer of timestamped samples.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    span_ms: u64,
    max_samples: usize,
    samples: VecDeque<Sample>,
}

impl TimeWindow {
    pub fn new(span: Duration) -> Self {
        Self::with_max_samples(span, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_max_samples(span: Duration, max_samples: usize) -> Self {
        Self {
            span_ms: u64::try_from(span.as_millis()).unwrap_or(u64::MAX),
            max_samples: max_samples.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn span(&self) -> Duration {
        Duration::from_millis(self.span_ms)
    }

    /// Add a sample observed at `now_ms`.
    pub fn record(&mut self, now_ms: u64, value: f64) {
        self.prune(now_ms);
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at_ms: now_ms, value });
    }

    /// Drop samples that fell out of the window.
    pub fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.span_ms);
        while self.samples.front().is_some_and(|s| s.at_ms < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn count(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.samples.len()
    }

    pub fn sum(&mut self, now_ms: u64) -> f64 {
        self.prune(now_ms);
        self.samples.iter().map(|s| s.value).sum()
    }

    /// Mean of the samples in the window, `None` when empty.
    pub fn mean(&mut self, now_ms: u64) -> Option<f64> {
        let count = self.count(now_ms);
        if count == 0 {
            return None;
        }
        Some(self.sum(now_ms) / count as f64)
    }

    pub fn max(&mut self, now_ms: u64) -> Option<f64> {
        self.prune(now_ms);
        self.samples.iter().map(|s| s.value).reduce(f64::max)
    }

    /// Sum of samples per second of window span.
    pub fn rate_per_sec(&mut self, now_ms: u64) -> f64 {
        if self.span_ms == 0 {
            return 0.0;
        }
        self.sum(now_ms) * 1000.0 / self.span_ms as f64
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
