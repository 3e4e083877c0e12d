//! Per-target counters, latency aggregates and bounded history.

use std::collections::HashMap;

use serde::Serialize;

use super::history::{History, Sample};
use super::tdigest_utils::estimate_percentiles;
use crate::probe::{ProbeOutcome, Target};

/// Point-in-time view of one target's statistics.
///
/// Latency fields are `None` until the first successful probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub loss_pct: f64,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub last_ms: Option<f64>,
    /// Estimated over the retained history window
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
}

/// Running statistics for a single target.
#[derive(Debug, Clone)]
pub struct TargetStats {
    sent: u64,
    received: u64,
    min_ms: Option<f64>,
    max_ms: Option<f64>,
    sum_ms: f64,
    last_ms: Option<f64>,
    history: History,
}

impl TargetStats {
    pub fn new(history_cap: Option<usize>) -> Self {
        Self {
            sent: 0,
            received: 0,
            min_ms: None,
            max_ms: None,
            sum_ms: 0.0,
            last_ms: None,
            history: History::new(history_cap),
        }
    }

    fn record(&mut self, outcome: &ProbeOutcome) {
        self.sent += 1;

        // A latency that is not finite and positive counts as lost
        let latency = outcome.kind.latency_ms().filter(|ms| ms.is_finite() && *ms > 0.0);
        if let Some(ms) = latency {
            self.received += 1;
            self.sum_ms += ms;
            self.min_ms = Some(self.min_ms.map_or(ms, |m| m.min(ms)));
            self.max_ms = Some(self.max_ms.map_or(ms, |m| m.max(ms)));
        }
        self.last_ms = latency;

        self.history.push(Sample {
            timestamp: outcome.timestamp,
            seq: outcome.seq,
            latency_ms: latency,
        });
    }

    /// Zero all counters and clear the history.
    pub fn reset(&mut self) {
        *self = Self::new(self.history.cap());
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Loss percentage in `[0, 100]`; 0 before anything was sent.
    pub fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent - self.received) as f64 / self.sent as f64 * 100.0
    }

    /// Mean over successful probes only, kept inside `[min, max]`.
    pub fn mean_ms(&self) -> Option<f64> {
        let (min, max) = (self.min_ms?, self.max_ms?);
        Some((self.sum_ms / self.received as f64).clamp(min, max))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let percentiles = estimate_percentiles(&self.history.latencies());

        StatsSnapshot {
            sent: self.sent,
            received: self.received,
            loss_pct: self.loss_pct(),
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            mean_ms: self.mean_ms(),
            last_ms: self.last_ms,
            p50_ms: percentiles.map(|p| p.p50),
            p95_ms: percentiles.map(|p| p.p95),
        }
    }
}

/// Statistics for every tracked target.
///
/// Outcomes for targets without an entry are stale and dropped.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    history_cap: Option<usize>,
    entries: HashMap<Target, TargetStats>,
}

impl StatsAggregator {
    pub fn new(history_cap: Option<usize>) -> Self {
        Self {
            history_cap,
            entries: HashMap::new(),
        }
    }

    /// Create an empty entry for `target`. Returns false if one exists.
    pub fn track(&mut self, target: Target) -> bool {
        if self.entries.contains_key(&target) {
            return false;
        }
        self.entries.insert(target, TargetStats::new(self.history_cap));
        true
    }

    /// Drop the entry for `target`. Returns false if there was none.
    pub fn untrack(&mut self, target: &str) -> bool {
        self.entries.remove(target).is_some()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.entries.contains_key(target)
    }

    /// Record one outcome. Returns false if the outcome was stale.
    pub fn record(&mut self, outcome: &ProbeOutcome) -> bool {
        match self.entries.get_mut(outcome.target.as_str()) {
            Some(stats) => {
                stats.record(outcome);
                true
            }
            None => false,
        }
    }

    /// Zero one entry without removing it.
    pub fn reset(&mut self, target: &str) -> bool {
        match self.entries.get_mut(target) {
            Some(stats) => {
                stats.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&mut self) {
        self.entries.values_mut().for_each(TargetStats::reset);
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, target: &str) -> Option<&TargetStats> {
        self.entries.get(target)
    }

    pub fn snapshot(&self, target: &str) -> Option<StatsSnapshot> {
        self.entries.get(target).map(TargetStats::snapshot)
    }

    pub fn history(&self, target: &str) -> Option<Vec<Sample>> {
        self.entries.get(target).map(|s| s.history.to_vec())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
