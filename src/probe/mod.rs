//! Probe module for host reachability measurement.
//!
//! A [`Prober`] performs one blocking measurement against one target and
//! classifies the result into an [`OutcomeKind`]. The engines in
//! [`crate::scheduler`] wrap each kind into a [`ProbeOutcome`] carrying the
//! target, its sequence number and the time the probe was issued.

mod ping;

pub use ping::*;

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probe error types raised inside a prober before classification.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("name resolution failed: {0}")]
    Resolve(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl From<ProbeError> for OutcomeKind {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Timeout(_) => OutcomeKind::Timeout,
            ProbeError::Resolve(_) => OutcomeKind::NameResolutionFailed,
            ProbeError::InvalidAddress(_) => OutcomeKind::InvalidAddress,
            ProbeError::Permission(_) => OutcomeKind::PermissionDenied,
            other @ (ProbeError::Network(_) | ProbeError::Command(_)) => {
                OutcomeKind::UnexpectedError {
                    detail: other.to_string(),
                }
            }
        }
    }
}

/// A hostname or IP address to probe.
///
/// Identity is the string itself; `"localhost"` and `"127.0.0.1"` are
/// different targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for Target {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl AsRef<str> for Target {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Target {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Classified result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Echo reply received; round-trip time in milliseconds, one decimal.
    Success { latency_ms: f64 },
    Timeout,
    NameResolutionFailed,
    InvalidAddress,
    /// The process may not open ICMP sockets. Retrying cannot succeed.
    PermissionDenied,
    UnexpectedError { detail: String },
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success { .. })
    }

    pub fn latency_ms(&self) -> Option<f64> {
        match self {
            OutcomeKind::Success { latency_ms } => Some(*latency_ms),
            _ => None,
        }
    }

    /// Whether this outcome must halt the owning loop or scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OutcomeKind::PermissionDenied)
    }

    /// Short status label for tables.
    pub fn status_text(&self) -> &'static str {
        match self {
            OutcomeKind::Success { .. } => "Success",
            OutcomeKind::Timeout => "Timed out",
            OutcomeKind::NameResolutionFailed => "Host not found",
            OutcomeKind::InvalidAddress => "Invalid address",
            OutcomeKind::PermissionDenied => "Permission denied",
            OutcomeKind::UnexpectedError { .. } => "Unexpected error",
        }
    }

    /// User-facing warning for recoverable failures that deserve one.
    ///
    /// Timeouts are plain loss and produce no warning; the fatal kind is
    /// reported through [`crate::scheduler::Event::Fatal`] instead.
    pub fn warning(&self) -> Option<String> {
        match self {
            OutcomeKind::NameResolutionFailed => {
                Some("Host not found. Check DNS or network.".to_string())
            }
            OutcomeKind::InvalidAddress => Some("Invalid address.".to_string()),
            OutcomeKind::UnexpectedError { detail } => {
                Some(format!("An unexpected error occurred: {}", detail))
            }
            _ => None,
        }
    }
}

/// One probe attempt against one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub target: Target,
    /// Monotonic per target within a run, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: OutcomeKind,
}

impl ProbeOutcome {
    pub fn new(target: Target, seq: u64, timestamp: DateTime<Utc>, kind: OutcomeKind) -> Self {
        Self {
            target,
            seq,
            timestamp,
            kind,
        }
    }
}

/// A blocking reachability measurement.
///
/// Implementations must return within roughly `timeout` and must convert every
/// failure into an [`OutcomeKind`] rather than panicking.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, target: &Target, timeout: Duration) -> OutcomeKind;
}

/// Extra time granted to a prober past its timeout before the outcome is
/// forced to [`OutcomeKind::Timeout`].
pub const TIMEOUT_SLACK: Duration = Duration::from_millis(500);

/// Run one probe on the blocking thread pool.
///
/// The wait is bounded by `timeout` plus [`TIMEOUT_SLACK`], which also covers
/// name resolution inside the prober; a late prober keeps its blocking thread
/// until it returns, but its result is ignored. A panic inside the prober is
/// reported as [`OutcomeKind::UnexpectedError`] so it can never take down the
/// calling loop.
pub async fn run_probe(prober: Arc<dyn Prober>, target: Target, timeout: Duration) -> OutcomeKind {
    let handle = tokio::task::spawn_blocking(move || prober.probe(&target, timeout));

    match tokio::time::timeout(timeout.saturating_add(TIMEOUT_SLACK), handle).await {
        Ok(Ok(kind)) => checked_latency(kind),
        Ok(Err(e)) => OutcomeKind::UnexpectedError {
            detail: format!("probe task failed: {}", e),
        },
        Err(_) => OutcomeKind::Timeout,
    }
}

/// Reject success latencies that are not finite and positive.
fn checked_latency(kind: OutcomeKind) -> OutcomeKind {
    match kind {
        OutcomeKind::Success { latency_ms } if !(latency_ms.is_finite() && latency_ms > 0.0) => {
            OutcomeKind::UnexpectedError {
                detail: format!("prober reported invalid latency {}", latency_ms),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingProber;

    impl Prober for PanickingProber {
        fn probe(&self, _target: &Target, _timeout: Duration) -> OutcomeKind {
            panic!("socket exploded");
        }
    }

    #[test]
    fn test_probe_error_classification() {
        let timeout = Duration::from_secs(1);
        assert_eq!(OutcomeKind::from(ProbeError::Timeout(timeout)), OutcomeKind::Timeout);
        assert_eq!(
            OutcomeKind::from(ProbeError::Resolve("nope".into())),
            OutcomeKind::NameResolutionFailed
        );
        assert_eq!(
            OutcomeKind::from(ProbeError::InvalidAddress("1.2.3".into())),
            OutcomeKind::InvalidAddress
        );
        assert!(OutcomeKind::from(ProbeError::Permission("raw".into())).is_fatal());

        match OutcomeKind::from(ProbeError::Network("unreachable".into())) {
            OutcomeKind::UnexpectedError { detail } => assert!(detail.contains("unreachable")),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_outcome_kind_helpers() {
        let ok = OutcomeKind::Success { latency_ms: 23.4 };
        assert!(ok.is_success());
        assert_eq!(ok.latency_ms(), Some(23.4));
        assert!(ok.warning().is_none());

        assert_eq!(OutcomeKind::Timeout.latency_ms(), None);
        assert!(OutcomeKind::Timeout.warning().is_none());
        assert!(OutcomeKind::NameResolutionFailed.warning().unwrap().contains("Host not found"));
        assert!(!OutcomeKind::InvalidAddress.is_fatal());
        assert_eq!(OutcomeKind::PermissionDenied.status_text(), "Permission denied");
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let outcome = ProbeOutcome::new(
            Target::from("10.0.0.1"),
            2,
            Utc::now(),
            OutcomeKind::Success { latency_ms: 23.4 },
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["target"], "10.0.0.1");
        assert_eq!(json["seq"], 2);
        assert_eq!(json["kind"], "success");
        assert_eq!(json["latency_ms"], 23.4);

        let timeout = ProbeOutcome::new(Target::from("a"), 1, Utc::now(), OutcomeKind::Timeout);
        let json = serde_json::to_value(&timeout).unwrap();
        assert_eq!(json["kind"], "timeout");
    }

    #[test]
    fn test_target_identity_is_the_string() {
        assert_ne!(Target::from("localhost"), Target::from("127.0.0.1"));
        assert_eq!(Target::from("host").to_string(), "host");

        let mut set = std::collections::HashSet::new();
        set.insert(Target::from("a"));
        assert!(set.contains("a"));
    }

    struct FixedProber {
        kind: OutcomeKind,
        delay: Duration,
    }

    impl Prober for FixedProber {
        fn probe(&self, _target: &Target, _timeout: Duration) -> OutcomeKind {
            std::thread::sleep(self.delay);
            self.kind.clone()
        }
    }

    async fn run_fixed(kind: OutcomeKind, delay: Duration, timeout: Duration) -> OutcomeKind {
        let prober = Arc::new(FixedProber { kind, delay });
        run_probe(prober, Target::from("x"), timeout).await
    }

    #[tokio::test]
    async fn test_run_probe_rejects_invalid_latency() {
        for latency_ms in [f64::NAN, f64::INFINITY, 0.0, -3.0] {
            let kind = run_fixed(OutcomeKind::Success { latency_ms }, Duration::ZERO, Duration::from_secs(1)).await;
            assert!(matches!(kind, OutcomeKind::UnexpectedError { .. }), "{} accepted", latency_ms);
        }

        let kind = run_fixed(ok_kind(0.1), Duration::ZERO, Duration::from_secs(1)).await;
        assert_eq!(kind, ok_kind(0.1));
    }

    #[tokio::test]
    async fn test_run_probe_bounds_a_stuck_prober() {
        let started = std::time::Instant::now();
        let kind = run_fixed(ok_kind(5.0), Duration::from_millis(1500), Duration::from_millis(100)).await;

        assert_eq!(kind, OutcomeKind::Timeout);
        assert!(started.elapsed() < Duration::from_millis(100) + TIMEOUT_SLACK + Duration::from_millis(400));
    }

    fn ok_kind(latency_ms: f64) -> OutcomeKind {
        OutcomeKind::Success { latency_ms }
    }

    #[tokio::test]
    async fn test_run_probe_catches_panics() {
        let kind = run_probe(Arc::new(PanickingProber), Target::from("x"), Duration::from_millis(10)).await;
        assert!(matches!(kind, OutcomeKind::UnexpectedError { .. }));
    }
}
