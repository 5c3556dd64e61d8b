//! Latency Tracking
//!
//! Rolling-window recorder for operation durations and outcomes. Samples live
//! in a fixed-size ring buffer; once full, each new sample overwrites the
//! oldest. Percentiles are computed by sorting a copy of the window at
//! snapshot time.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Default number of samples kept.
pub const DEFAULT_LATENCY_CAPACITY: usize = 1000;

// =============================================================================
// Samples
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    duration_ms: f64,
    success: bool,
    recorded_at: Instant,
}

#[derive(Debug)]
struct RingBuffer {
    samples: Vec<LatencySample>,
    next: usize,
    total_recorded: u64,
}

impl RingBuffer {
    fn push(&mut self, sample: LatencySample, capacity: usize) {
        if self.samples.len() < capacity {
            self.samples.push(sample);
        } else if let Some(slot) = self.samples.get_mut(self.next) {
            *slot = sample;
        }
        self.next = (self.next + 1) % capacity;
        self.total_recorded += 1;
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Summary of the samples currently in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    /// Mean duration (milliseconds).
    pub mean_ms: f64,
    /// Fastest sample (milliseconds).
    pub min_ms: f64,
    /// Slowest sample (milliseconds).
    pub max_ms: f64,
    /// Median (milliseconds).
    pub p50_ms: f64,
    /// 95th percentile (milliseconds).
    pub p95_ms: f64,
    /// 99th percentile (milliseconds).
    pub p99_ms: f64,
    /// Fraction of samples that succeeded.
    pub success_rate: f64,
    /// Samples in the window.
    pub sample_count: usize,
    /// Samples recorded since creation or the last reset.
    pub total_recorded: u64,
    /// Window samples per second, measured from the oldest sample to now.
    pub throughput_per_sec: f64,
}

impl Default for LatencySnapshot {
    fn default() -> Self {
        Self {
            mean_ms: 0.0,
            min_ms: 0.0,
            max_ms: 0.0,
            p50_ms: 0.0,
            p95_ms: 0.0,
            p99_ms: 0.0,
            success_rate: 1.0,
            sample_count: 0,
            total_recorded: 0,
            throughput_per_sec: 0.0,
        }
    }
}

// =============================================================================
// Latency Tracker
// =============================================================================

/// Thread-safe rolling latency recorder.
#[derive(Debug)]
pub struct LatencyTracker {
    capacity: usize,
    buffer: Mutex<RingBuffer>,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_CAPACITY)
    }
}

impl LatencyTracker {
    /// Create a tracker keeping the most recent `capacity` samples (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(RingBuffer {
                samples: Vec::with_capacity(capacity),
                next: 0,
                total_recorded: 0,
            }),
        }
    }

    /// Record one operation.
    pub fn record(&self, duration: Duration, success: bool) {
        self.record_millis(duration.as_secs_f64() * 1000.0, success);
    }

    /// Record one operation measured in milliseconds.
    pub fn record_millis(&self, duration_ms: f64, success: bool) {
        let sample = LatencySample {
            duration_ms: duration_ms.max(0.0),
            success,
            recorded_at: Instant::now(),
        };
        self.buffer.lock().push(sample, self.capacity);
    }

    /// Window size.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every sample and zero the totals.
    pub fn reset(&self) {
        let mut buffer = self.buffer.lock();
        buffer.samples.clear();
        buffer.next = 0;
        buffer.total_recorded = 0;
    }

    /// Summarize the current window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> LatencySnapshot {
        let (mut durations, successes, oldest, total_recorded) = {
            let buffer = self.buffer.lock();
            let durations: Vec<f64> = buffer.samples.iter().map(|s| s.duration_ms).collect();
            let successes = buffer.samples.iter().filter(|s| s.success).count();
            let oldest = buffer.samples.iter().map(|s| s.recorded_at).min();
            (durations, successes, oldest, buffer.total_recorded)
        };

        if durations.is_empty() {
            return LatencySnapshot {
                total_recorded,
                ..LatencySnapshot::default()
            };
        }

        durations.sort_by(f64::total_cmp);
        let count = durations.len();
        let sum: f64 = durations.iter().sum();

        let throughput_per_sec = oldest
            .map(|t| t.elapsed().as_secs_f64())
            .filter(|secs| *secs > 0.0)
            .map_or(0.0, |secs| count as f64 / secs);

        LatencySnapshot {
            mean_ms: sum / count as f64,
            min_ms: durations.first().copied().unwrap_or_default(),
            max_ms: durations.last().copied().unwrap_or_default(),
            p50_ms: percentile(&durations, 0.50),
            p95_ms: percentile(&durations, 0.95),
            p99_ms: percentile(&durations, 0.99),
            success_rate: successes as f64 / count as f64,
            sample_count: count,
            total_recorded,
            throughput_per_sec,
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() - 1) as f64 * pct).round() as usize;
    sorted
        .get(rank.min(sorted.len() - 1))
        .copied()
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
