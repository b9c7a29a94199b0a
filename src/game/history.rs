//! Position history for lag compensation
//!
//! Each player keeps a fixed-capacity ring of `(timestamp, position)` samples
//! recorded once per tick. Hit tests rewind victims by looking up where they
//! were at the shooter's compensated time.

use std::collections::VecDeque;

use crate::config::MAX_HISTORY_WINDOW_MS;
use crate::sim::Vec2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub position: Vec2,
}

#[derive(Debug, Clone)]
pub struct PositionHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl PositionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Capacity covering `window_ms` of history at `tick_rate`
    pub fn for_window(window_ms: u64, tick_rate: u32) -> Self {
        let window_ms = window_ms.min(MAX_HISTORY_WINDOW_MS);
        Self::new((window_ms * tick_rate as u64 / 1000) as usize)
    }

    /// Append a sample, evicting the oldest when full
    ///
    /// Samples older than the newest one are ignored so the ring stays sorted.
    pub fn record(&mut self, timestamp: u64, position: Vec2) {
        if let Some(last) = self.entries.back() {
            if timestamp < last.timestamp {
                return;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            timestamp,
            position,
        });
    }

    /// Position at `timestamp`
    ///
    /// Interpolates between the bracketing samples. Queries before the oldest
    /// sample clamp to the oldest; queries after the newest clamp to the newest.
    pub fn position_at(&self, timestamp: u64) -> Option<Vec2> {
        let oldest = self.entries.front()?;
        let newest = self.entries.back()?;

        if timestamp <= oldest.timestamp {
            return Some(oldest.position);
        }
        if timestamp >= newest.timestamp {
            return Some(newest.position);
        }

        // First entry strictly after the query; it has a predecessor because
        // the query is after the oldest sample
        let idx = self.entries.partition_point(|e| e.timestamp <= timestamp);
        let after = self.entries[idx];
        let before = self.entries[idx - 1];

        let span = (after.timestamp - before.timestamp) as f32;
        if span <= 0.0 {
            return Some(after.position);
        }
        let t = (timestamp - before.timestamp) as f32 / span;
        Some(before.position.lerp(after.position, t))
    }

    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.entries.front().map(|e| e.timestamp)
    }

    pub fn newest_timestamp(&self) -> Option<u64> {
        self.entries.back().map(|e| e.timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
