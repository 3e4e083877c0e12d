//! Statistics module for probe outcomes.
//!
//! Keeps per-target counters, latency aggregates and a bounded sample
//! history, and exports them as CSV.

mod aggregator;
mod export;
mod history;
mod tdigest_utils;

pub use aggregator::*;
pub use export::*;
pub use history::*;
pub use tdigest_utils::*;
