//! Process-wide transfer statistics.
//!
//! [`Statistics`] is shared by every connection worker through an `Arc`.
//! Workers accumulate into a [`LocalCounters`] and flush in batches, so the
//! shared counters see one atomic add per batch rather than one per message.
//! All state is running sums and is independent of the number of
//! connections or messages.

use metriken::AtomicHistogram;
use metriken::histogram::Histogram;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate byte, message and latency counters.
pub struct Statistics {
    bytes: AtomicU64,
    messages: AtomicU64,
    flushes: AtomicU64,
    latency_samples: AtomicU64,
    latency_sum_us: AtomicU64,
    /// Latency distribution in microseconds.
    latency: AtomicHistogram,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency: AtomicHistogram::new(7, 64),
        }
    }

    /// Add a worker's accumulated deltas to the totals.
    pub fn flush(&self, delta_bytes: u64, delta_messages: u64) {
        self.bytes.fetch_add(delta_bytes, Ordering::Relaxed);
        self.messages.fetch_add(delta_messages, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one round-trip latency sample.
    pub fn sample_latency(&self, micros: u64) {
        self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        let _ = self.latency.increment(micros);
    }

    /// Read the current totals.
    ///
    /// Concurrent flushes may or may not be included, but totals never
    /// decrease between snapshots.
    pub fn snapshot(&self) -> Snapshot {
        let histogram = self.latency.load();
        Snapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            latency_samples: self.latency_samples.load(Ordering::Relaxed),
            latency_sum_us: self.latency_sum_us.load(Ordering::Relaxed),
            percentiles: histogram.as_ref().map(LatencyPercentiles::from_histogram),
        }
    }
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub bytes: u64,
    pub messages: u64,
    pub flushes: u64,
    pub latency_samples: u64,
    pub latency_sum_us: u64,
    pub percentiles: Option<LatencyPercentiles>,
}

impl Snapshot {
    /// Mean sampled latency in microseconds.
    pub fn mean_latency_us(&self) -> Option<f64> {
        if self.latency_samples == 0 {
            return None;
        }
        Some(self.latency_sum_us as f64 / self.latency_samples as f64)
    }
}

/// Latency percentiles in microseconds, taken from bucket upper bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyPercentiles {
    fn from_histogram(histogram: &Histogram) -> Self {
        let mut out = Self::default();
        if let Ok(Some(results)) = histogram.percentiles(&[50.0, 90.0, 99.0, 100.0]) {
            for (pct, bucket) in results {
                let value = bucket.end();
                match pct as u32 {
                    50 => out.p50_us = value,
                    90 => out.p90_us = value,
                    99 => out.p99_us = value,
                    _ => out.max_us = value,
                }
            }
        }
        out
    }
}

/// Per-worker counters that are periodically flushed into [`Statistics`].
#[derive(Debug, Default)]
pub struct LocalCounters {
    bytes: u64,
    messages: u64,
}

impl LocalCounters {
    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.messages += 1;
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Move the accumulated deltas into `stats` and zero them.
    pub fn flush_into(&mut self, stats: &Statistics) {
        if self.bytes == 0 && self.messages == 0 {
            return;
        }
        stats.flush(self.bytes, self.messages);
        self.bytes = 0;
        self.messages = 0;
    }
}
