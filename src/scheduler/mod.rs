//! Scheduler module for running probes and reporting outcomes.
//!
//! [`ProbeLoop`] probes one target at a fixed interval; [`MultiTargetScheduler`]
//! probes a mutable set of targets once per cycle. Both run on their own tokio
//! task and push [`Event`]s into an ordered, unbounded channel handed out at
//! construction, so a slow consumer never holds up probing or `stop()`.

mod multi;
mod probe_loop;
#[cfg(test)]
mod testing;

pub use multi::*;
pub use probe_loop::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;

use crate::config::ConfigError;
use crate::probe::{OutcomeKind, ProbeOutcome, Target};

const PERMISSION_DETAIL: &str =
    "ICMP ping requires administrator privileges. Please restart as administrator.";

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("a run is already active")]
    AlreadyRunning,
    #[error("no targets to probe")]
    NoTargets,
    #[error("invalid settings: {0}")]
    Config(#[from] ConfigError),
}

/// Notifications pushed to the consumer, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started,
    Outcome(ProbeOutcome),
    /// The process lacks ICMP privileges; the run is halting.
    Fatal { target: Target, detail: String },
    /// Always the last event of a run, exactly once.
    Finished { reason: StopReason },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Fatal,
    /// The event receiver was dropped.
    ConsumerGone,
}

/// Observable state of a loop or scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    StoppingRequested,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_done(done: &watch::Receiver<bool>) -> bool {
    *done.borrow() || done.has_changed().is_err()
}

struct Run {
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Start/stop bookkeeping shared by both engines.
///
/// At most one run is active at a time. Stopping resolves only once the run's
/// task has emitted [`Event::Finished`].
#[derive(Default)]
pub(crate) struct Lifecycle {
    run: Mutex<Option<Run>>,
}

impl Lifecycle {
    /// Claim the lifecycle for a new run.
    pub(crate) fn begin(&self) -> Result<RunSignals, SchedulerError> {
        let mut run = lock(&self.run);

        if let Some(current) = run.as_ref() {
            if !is_done(&current.done_rx) {
                return Err(SchedulerError::AlreadyRunning);
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        *run = Some(Run { stop_tx, done_rx });

        Ok(RunSignals {
            stop: stop_rx,
            done: done_tx,
        })
    }

    /// Request a stop and wait for the run to drain. Idempotent.
    pub(crate) async fn stop(&self) {
        let mut done = {
            let run = lock(&self.run);
            match run.as_ref() {
                Some(current) => {
                    current.stop_tx.send_replace(true);
                    current.done_rx.clone()
                }
                None => return,
            }
        };

        // Err means the task is gone without reporting, which is also done
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub(crate) fn state(&self) -> LoopState {
        let run = lock(&self.run);
        match run.as_ref() {
            None => LoopState::Idle,
            Some(current) if is_done(&current.done_rx) => LoopState::Idle,
            Some(current) if *current.stop_tx.borrow() => LoopState::StoppingRequested,
            Some(_) => LoopState::Running,
        }
    }
}

/// The task side of a run: observes stop requests and reports completion.
pub(crate) struct RunSignals {
    stop: watch::Receiver<bool>,
    done: watch::Sender<bool>,
}

impl RunSignals {
    /// True once a stop was requested or the owning engine was dropped.
    pub(crate) fn stop_requested(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    pub(crate) async fn stopped(&mut self) {
        let _ = self.stop.wait_for(|stop| *stop).await;
    }

    pub(crate) fn finish(self) {
        self.done.send_replace(true);
    }
}

/// Log an outcome at a level matching its severity.
pub(crate) fn log_outcome(outcome: &ProbeOutcome) {
    match &outcome.kind {
        OutcomeKind::Success { latency_ms } => {
            tracing::debug!("{} #{}: {:.1} ms", outcome.target, outcome.seq, latency_ms);
        }
        OutcomeKind::Timeout => {
            tracing::debug!("{} #{}: timed out", outcome.target, outcome.seq);
        }
        OutcomeKind::NameResolutionFailed | OutcomeKind::InvalidAddress => {
            tracing::warn!("{} #{}: {}", outcome.target, outcome.seq, outcome.kind.status_text());
        }
        OutcomeKind::PermissionDenied => {
            tracing::error!("{} #{}: {}", outcome.target, outcome.seq, PERMISSION_DETAIL);
        }
        OutcomeKind::UnexpectedError { detail } => {
            tracing::error!("Probe failed for {} #{}: {}", outcome.target, outcome.seq, detail);
        }
    }
}

fn fatal_event(target: Target) -> Event {
    Event::Fatal {
        target,
        detail: PERMISSION_DETAIL.to_string(),
    }
}
