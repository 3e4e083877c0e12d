//! pingtrail - continuous ICMP reachability and latency monitoring.
//!
//! Probe one host with [`scheduler::ProbeLoop`] or a changing set of hosts with
//! [`scheduler::MultiTargetScheduler`]. Both report through an ordered event
//! channel and keep per-target statistics in a [`stats::StatsAggregator`].

pub mod config;
pub mod probe;
pub mod scheduler;
pub mod stats;
