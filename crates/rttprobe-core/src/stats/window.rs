//! Time-bounded rolling window of RTT samples
//!
//! Keeps only the samples that arrived within the last [`WINDOW_MS`] and
//! summarizes them as an average and a median.

use crate::WINDOW_MS;
use serde::Serialize;
use std::collections::VecDeque;

/// One sample held by the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// Arrival time (epoch ms)
    pub t: i64,
    /// Round-trip time (ms)
    pub v: i64,
}

/// Average and median of the window at one evaluation instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RollingSummary {
    /// Mean RTT, rounded to 2 decimals (ms)
    pub average: f64,
    /// Median RTT, rounded to 2 decimals (ms)
    pub median: f64,
    /// Number of samples the summary covers
    pub count: usize,
}

/// Rolling window keyed by arrival time
#[derive(Debug, Clone)]
pub struct RollingWindow {
    entries: VecDeque<WindowEntry>,
    span_ms: i64,
}

impl RollingWindow {
    /// Create a window spanning [`WINDOW_MS`]
    pub fn new() -> Self {
        Self::with_span(WINDOW_MS)
    }

    /// Create a window with a custom span (ms)
    pub fn with_span(span_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            span_ms,
        }
    }

    /// Append a sample in arrival order
    pub fn push(&mut self, t: i64, v: i64) {
        self.entries.push_back(WindowEntry { t, v });
    }

    /// Drop every entry with `t <= now - span`
    ///
    /// Entries normally arrive in time order, but a wall-clock step can put
    /// an older timestamp behind a newer one, so the whole window is scanned.
    pub fn evict(&mut self, now: i64) {
        let cutoff = now - self.span_ms;
        self.entries.retain(|e| e.t > cutoff);
    }

    /// Evict stale entries and summarize what is left
    ///
    /// Returns `None` when the window is empty after eviction.
    pub fn refresh(&mut self, now: i64) -> Option<RollingSummary> {
        self.evict(now);
        let values: Vec<i64> = self.entries.iter().map(|e| e.v).collect();
        summarize(&values)
    }

    /// Entries currently held, oldest first
    pub fn entries(&self) -> &VecDeque<WindowEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Round to 2 fractional digits
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Average and median of a set of values
///
/// The median is the middle element of the sorted values for an odd count
/// and the mean of the two middle elements for an even count.
pub fn summarize(values: &[i64]) -> Option<RollingSummary> {
    if values.is_empty() {
        return None;
    }

    let count = values.len();
    let sum: f64 = values.iter().map(|v| *v as f64).sum();
    let average = sum / count as f64;

    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = count / 2;
    let median = if count % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    };

    Some(RollingSummary {
        average: round2(average),
        median: round2(median),
        count,
    })
}
