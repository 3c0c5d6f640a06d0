//! Bounded FIFO buffer for live samples.
//!
//! Holds the most recent `capacity` samples of the current session. Pushing into a full
//! buffer evicts the oldest sample, so memory use is fixed however long a session runs.

use crate::measurement::Sample;
use std::collections::VecDeque;

/// Default live-buffer capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Fixed-capacity FIFO of [`Sample`]s.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleBuffer {
    /// Create a buffer holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest if full. Returns the evicted sample.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Copy of the contents in insertion order.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    /// Samples from the last `seconds` of session time, measured back from the newest.
    pub fn window(&self, seconds: f64) -> Vec<Sample> {
        let Some(latest) = self.latest() else {
            return Vec::new();
        };
        let cutoff = latest.t_seconds - seconds.max(0.0);
        // Not a suffix search: the buffer may span several sessions.
        self.samples
            .iter()
            .filter(|s| s.t_seconds >= cutoff)
            .cloned()
            .collect()
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
