//! Chart series keyed by probe sequence id
//!
//! Each transport keeps the (sequence id, rtt) points of its most recent
//! replies. Points fall out once their id lags the run's sequence counter by
//! more than `MAX_SAMPLES + SERIES_LAG`, so a transport that loses probes
//! still shows a window aligned with the others.

use crate::{MAX_SAMPLES, SERIES_LAG};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One chart point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Probe sequence id
    pub x: u64,
    /// Round-trip time (ms)
    pub y: i64,
}

/// Recommended chart x-axis range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: u64,
    pub max: u64,
}

impl AxisRange {
    /// Range showing the most recent `MAX_SAMPLES` probes
    pub fn for_counter(sequence_counter: u64) -> Self {
        Self {
            min: sequence_counter.saturating_sub(MAX_SAMPLES),
            max: sequence_counter.max(MAX_SAMPLES),
        }
    }
}

/// Sliding buffer of chart points for one transport
#[derive(Debug, Clone, Default)]
pub struct SeriesBuffer {
    points: VecDeque<SeriesPoint>,
}

impl SeriesBuffer {
    /// Largest number of points ever retained
    pub const CAPACITY: usize = (MAX_SAMPLES + SERIES_LAG) as usize;

    pub fn new() -> Self {
        Self {
            points: VecDeque::with_capacity(Self::CAPACITY),
        }
    }

    /// Lowest sequence id a point may carry at `sequence_counter`
    pub fn floor(sequence_counter: u64) -> u64 {
        sequence_counter.saturating_sub(MAX_SAMPLES + SERIES_LAG)
    }

    /// Append a point at the tail, then evict stale points
    ///
    /// Replies on one transport normally arrive in id order, making this a
    /// head eviction. Reordered or late replies are still appended where
    /// they arrive; any of them below the floor go out too.
    pub fn append(&mut self, x: u64, y: i64, sequence_counter: u64) {
        self.points.push_back(SeriesPoint { x, y });
        self.evict(sequence_counter);
    }

    /// Apply the staleness rule and the point cap
    pub fn evict(&mut self, sequence_counter: u64) {
        let floor = Self::floor(sequence_counter);
        while self.points.front().is_some_and(|p| p.x < floor) {
            self.points.pop_front();
        }
        if self.points.iter().any(|p| p.x < floor) {
            self.points.retain(|p| p.x >= floor);
        }
        while self.points.len() > Self::CAPACITY {
            self.points.pop_front();
        }
    }

    /// Points in arrival order
    pub fn points(&self) -> &VecDeque<SeriesPoint> {
        &self.points
    }

    /// Points copied out for rendering
    pub fn to_vec(&self) -> Vec<SeriesPoint> {
        self.points.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}
