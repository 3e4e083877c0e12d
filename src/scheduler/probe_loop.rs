//! Continuous probing of a single target.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use super::{fatal_event, lock, log_outcome, Event, Lifecycle, LoopState, RunSignals, SchedulerError, StopReason};
use crate::config::ProbeSettings;
use crate::probe::{run_probe, ProbeOutcome, Prober, Target};
use crate::stats::{Sample, StatsAggregator, StatsSnapshot};

/// Probes one target, waits `interval`, and repeats until stopped.
pub struct ProbeLoop {
    prober: Arc<dyn Prober>,
    settings: ProbeSettings,
    events: mpsc::UnboundedSender<Event>,
    stats: Arc<Mutex<StatsAggregator>>,
    target: Mutex<Option<Target>>,
    lifecycle: Lifecycle,
}

impl ProbeLoop {
    /// Create an idle loop and the receiver for its events.
    pub fn new(prober: Arc<dyn Prober>, settings: ProbeSettings) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = StatsAggregator::new(settings.history_cap);

        let probe_loop = Self {
            prober,
            settings,
            events: tx,
            stats: Arc::new(Mutex::new(stats)),
            target: Mutex::new(None),
            lifecycle: Lifecycle::default(),
        };
        (probe_loop, rx)
    }

    /// Start probing `target` every `interval`.
    ///
    /// Statistics from the previous run are discarded and sequence numbers
    /// restart at 1. Must be called from within a tokio runtime.
    pub fn start(&self, target: impl Into<Target>, interval: Duration) -> Result<(), SchedulerError> {
        let target = target.into();
        let settings = ProbeSettings {
            interval,
            ..self.settings.clone()
        };
        settings.validate()?;

        let signals = self.lifecycle.begin()?;

        {
            let mut stats = lock(&self.stats);
            stats.clear();
            stats.track(target.clone());
        }
        *lock(&self.target) = Some(target.clone());

        tracing::info!("Probe loop: starting {} every {:?}", target, interval);

        tokio::spawn(run_probe_loop(
            self.prober.clone(),
            target,
            settings,
            self.stats.clone(),
            self.events.clone(),
            signals,
        ));
        Ok(())
    }

    /// Stop probing and wait until `Finished` has been emitted.
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    pub fn state(&self) -> LoopState {
        self.lifecycle.state()
    }

    /// The target of the current or most recent run.
    pub fn target(&self) -> Option<Target> {
        lock(&self.target).clone()
    }

    /// Statistics of the current or most recent run.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        let target = self.target()?;
        lock(&self.stats).snapshot(target.as_str())
    }

    /// Retained samples of the current or most recent run, oldest first.
    pub fn history(&self) -> Vec<Sample> {
        let Some(target) = self.target() else {
            return Vec::new();
        };
        lock(&self.stats).history(target.as_str()).unwrap_or_default()
    }
}

async fn run_probe_loop(
    prober: Arc<dyn Prober>,
    target: Target,
    settings: ProbeSettings,
    stats: Arc<Mutex<StatsAggregator>>,
    events: mpsc::UnboundedSender<Event>,
    mut signals: RunSignals,
) {
    let reason = drive(&prober, &target, &settings, &stats, &events, &mut signals).await;

    if events.send(Event::Finished { reason }).is_err() {
        tracing::debug!("Probe loop: consumer gone before finish of {}", target);
    }
    tracing::info!("Probe loop: {} finished ({:?})", target, reason);
    signals.finish();
}

async fn drive(
    prober: &Arc<dyn Prober>,
    target: &Target,
    settings: &ProbeSettings,
    stats: &Mutex<StatsAggregator>,
    events: &mpsc::UnboundedSender<Event>,
    signals: &mut RunSignals,
) -> StopReason {
    if events.send(Event::Started).is_err() {
        return StopReason::ConsumerGone;
    }

    let mut seq: u64 = 0;
    loop {
        if signals.stop_requested() {
            return StopReason::Requested;
        }

        seq += 1;
        let timestamp = Utc::now();
        let kind = run_probe(prober.clone(), target.clone(), settings.timeout).await;
        let outcome = ProbeOutcome::new(target.clone(), seq, timestamp, kind);
        log_outcome(&outcome);

        let fatal = outcome.kind.is_fatal();
        lock(stats).record(&outcome);

        // The in-flight outcome is delivered even if a stop arrived meanwhile
        if events.send(Event::Outcome(outcome)).is_err() {
            return StopReason::ConsumerGone;
        }

        if fatal {
            let _ = events.send(fatal_event(target.clone()));
            return StopReason::Fatal;
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.interval) => {}
            _ = signals.stopped() => return StopReason::Requested,
        }
    }
}
