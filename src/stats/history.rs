//! Bounded per-target sample history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One recorded probe: a latency, or `None` for a lost probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
    pub latency_ms: Option<f64>,
}

/// Ring buffer of recent samples. With a cap, the oldest sample is evicted
/// once the buffer is full.
#[derive(Debug, Clone)]
pub struct History {
    samples: VecDeque<Sample>,
    cap: Option<usize>,
}

impl History {
    pub fn new(cap: Option<usize>) -> Self {
        let initial = cap.unwrap_or(64).min(1024);
        Self {
            samples: VecDeque::with_capacity(initial),
            cap,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        match self.cap {
            Some(0) => return,
            Some(cap) if self.samples.len() >= cap => {
                self.samples.pop_front();
            }
            _ => {}
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Latencies of retained successful samples, oldest first.
    pub fn latencies(&self) -> Vec<f64> {
        self.samples.iter().filter_map(|s| s.latency_ms).collect()
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64, latency_ms: Option<f64>) -> Sample {
        Sample {
            timestamp: Utc::now(),
            seq,
            latency_ms,
        }
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut history = History::new(Some(3));
        for seq in 1..=5 {
            history.push(sample(seq, Some(seq as f64)));
        }

        assert_eq!(history.len(), 3);
        let seqs: Vec<u64> = history.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let mut history = History::new(None);
        for seq in 1..=2000 {
            history.push(sample(seq, None));
        }
        assert_eq!(history.len(), 2000);
    }

    #[test]
    fn test_latencies_skip_losses() {
        let mut history = History::new(Some(10));
        history.push(sample(1, Some(10.0)));
        history.push(sample(2, None));
        history.push(sample(3, Some(30.0)));

        assert_eq!(history.latencies(), vec![10.0, 30.0]);

        history.clear();
        assert!(history.is_empty());
    }
}
