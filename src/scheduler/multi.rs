//! Round-robin probing of a mutable set of targets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::{fatal_event, lock, log_outcome, Event, Lifecycle, LoopState, RunSignals, SchedulerError, StopReason};
use crate::config::ProbeSettings;
use crate::probe::{run_probe, ProbeOutcome, Prober, Target};
use crate::stats::{Sample, StatsAggregator, StatsSnapshot};

/// A target in the active set. The epoch identifies this membership, so an
/// outcome from before a remove/re-add is never credited to the new entry.
struct Member {
    target: Target,
    epoch: u64,
    next_seq: u64,
}

/// Permission to probe a target once.
#[derive(Debug, Clone, Copy)]
struct Claim {
    epoch: u64,
    seq: u64,
}

/// Active set and its statistics, always mutated together.
struct Registry {
    members: Vec<Member>,
    stats: StatsAggregator,
    next_epoch: u64,
}

impl Registry {
    fn new(history_cap: Option<usize>) -> Self {
        Self {
            members: Vec::new(),
            stats: StatsAggregator::new(history_cap),
            next_epoch: 1,
        }
    }

    fn position(&self, target: &str) -> Option<usize> {
        self.members.iter().position(|m| m.target.as_str() == target)
    }

    fn add(&mut self, target: Target) -> bool {
        if self.position(target.as_str()).is_some() {
            return false;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.stats.track(target.clone());
        self.members.push(Member {
            target,
            epoch,
            next_seq: 1,
        });
        true
    }

    fn remove(&mut self, target: &str) -> bool {
        match self.position(target) {
            Some(index) => {
                self.members.remove(index);
                self.stats.untrack(target);
                true
            }
            None => false,
        }
    }

    /// Reserve the next sequence number for the membership `epoch`, or `None`
    /// if that membership has ended (removed, or removed and re-added).
    fn claim(&mut self, target: &str, epoch: u64) -> Option<Claim> {
        let index = self.position(target)?;
        let member = &mut self.members[index];
        if member.epoch != epoch {
            return None;
        }
        let seq = member.next_seq;
        member.next_seq += 1;
        Some(Claim {
            epoch: member.epoch,
            seq,
        })
    }

    /// Record an outcome if its membership is still current.
    fn record(&mut self, epoch: u64, outcome: &ProbeOutcome) -> bool {
        let current = self
            .position(outcome.target.as_str())
            .is_some_and(|index| self.members[index].epoch == epoch);
        current && self.stats.record(outcome)
    }

    fn restart(&mut self) {
        for member in &mut self.members {
            member.next_seq = 1;
        }
        self.stats.reset_all();
    }

    fn targets(&self) -> Vec<Target> {
        self.members.iter().map(|m| m.target.clone()).collect()
    }

    /// Current memberships, in probing order.
    fn roster(&self) -> Vec<(Target, u64)> {
        self.members.iter().map(|m| (m.target.clone(), m.epoch)).collect()
    }
}

/// Probes every target once per cycle, sharing one cadence.
///
/// Targets can be added and removed while running. Each target's statistics
/// entry exists exactly as long as the target is in the set.
pub struct MultiTargetScheduler {
    prober: Arc<dyn Prober>,
    settings: ProbeSettings,
    events: mpsc::UnboundedSender<Event>,
    registry: Arc<Mutex<Registry>>,
    lifecycle: Lifecycle,
}

impl MultiTargetScheduler {
    /// Create an idle scheduler and the receiver for its events.
    pub fn new(prober: Arc<dyn Prober>, settings: ProbeSettings) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Registry::new(settings.history_cap);

        let scheduler = Self {
            prober,
            settings,
            events: tx,
            registry: Arc::new(Mutex::new(registry)),
            lifecycle: Lifecycle::default(),
        };
        (scheduler, rx)
    }

    /// Add a target. Returns false if it is already present.
    ///
    /// The statistics entry exists immediately; a running scheduler probes the
    /// target from the next cycle on.
    pub fn add_target(&self, target: impl Into<Target>) -> bool {
        let target = target.into();
        let added = lock(&self.registry).add(target.clone());
        if added {
            tracing::info!("Scheduler: Adding target {}", target);
        }
        added
    }

    /// Remove a target and its statistics. Returns false if it was absent.
    ///
    /// The target is never probed again; an outcome already in flight is
    /// discarded when it completes.
    pub fn remove_target(&self, target: &str) -> bool {
        let removed = lock(&self.registry).remove(target);
        if removed {
            tracing::info!("Scheduler: Removed target {}", target);
        }
        removed
    }

    /// Active targets in probing order.
    pub fn targets(&self) -> Vec<Target> {
        lock(&self.registry).targets()
    }

    /// Start probing all targets. Statistics and sequences restart from zero.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.settings.validate()?;

        let count = lock(&self.registry).members.len();
        if count == 0 {
            return Err(SchedulerError::NoTargets);
        }

        let signals = self.lifecycle.begin()?;
        lock(&self.registry).restart();

        tracing::info!(
            "Starting scheduler with {} targets every {:?}",
            count,
            self.settings.interval
        );

        tokio::spawn(run_scheduler(
            self.prober.clone(),
            self.settings.clone(),
            self.registry.clone(),
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

    pub fn stats(&self, target: &str) -> Option<StatsSnapshot> {
        lock(&self.registry).stats.snapshot(target)
    }

    /// Statistics for every active target, in probing order.
    pub fn snapshot(&self) -> Vec<(Target, StatsSnapshot)> {
        let registry = lock(&self.registry);
        registry
            .members
            .iter()
            .filter_map(|m| {
                let snap = registry.stats.snapshot(m.target.as_str())?;
                Some((m.target.clone(), snap))
            })
            .collect()
    }

    pub fn history(&self, target: &str) -> Option<Vec<Sample>> {
        lock(&self.registry).stats.history(target)
    }
}

async fn run_scheduler(
    prober: Arc<dyn Prober>,
    settings: ProbeSettings,
    registry: Arc<Mutex<Registry>>,
    events: mpsc::UnboundedSender<Event>,
    mut signals: RunSignals,
) {
    let reason = drive(&prober, &settings, &registry, &events, &mut signals).await;

    if events.send(Event::Finished { reason }).is_err() {
        tracing::debug!("Scheduler: consumer gone before finish");
    }
    tracing::info!("Scheduler: finished ({:?})", reason);
    signals.finish();
}

async fn drive(
    prober: &Arc<dyn Prober>,
    settings: &ProbeSettings,
    registry: &Mutex<Registry>,
    events: &mpsc::UnboundedSender<Event>,
    signals: &mut RunSignals,
) -> StopReason {
    if events.send(Event::Started).is_err() {
        return StopReason::ConsumerGone;
    }

    loop {
        let cycle_start = Instant::now();

        if let Some(reason) = run_cycle(prober, settings, registry, events, signals).await {
            return reason;
        }
        if signals.stop_requested() {
            return StopReason::Requested;
        }

        // An overrunning cycle is followed immediately by the next one
        let remaining = settings.interval.saturating_sub(cycle_start.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = signals.stopped() => return StopReason::Requested,
        }
    }
}

/// Probe each target of the current set once.
///
/// Returns a stop reason if the run must end.
async fn run_cycle(
    prober: &Arc<dyn Prober>,
    settings: &ProbeSettings,
    registry: &Mutex<Registry>,
    events: &mpsc::UnboundedSender<Event>,
    signals: &RunSignals,
) -> Option<StopReason> {
    let mut queue: VecDeque<(Target, u64)> = lock(registry).roster().into();
    let mut in_flight: JoinSet<(u64, ProbeOutcome)> = JoinSet::new();
    let mut halted: Option<StopReason> = None;

    loop {
        while halted.is_none() && in_flight.len() < settings.max_in_flight && !signals.stop_requested() {
            let Some((target, epoch)) = queue.pop_front() else {
                break;
            };

            // Membership is re-checked right before probing; a re-added target
            // waits for the next cycle
            let claim = lock(registry).claim(target.as_str(), epoch);
            let Some(claim) = claim else {
                tracing::debug!("Scheduler: {} was removed, skipping", target);
                continue;
            };

            let prober = prober.clone();
            let timeout = settings.timeout;
            in_flight.spawn(async move {
                let timestamp = Utc::now();
                let kind = run_probe(prober, target.clone(), timeout).await;
                (claim.epoch, ProbeOutcome::new(target, claim.seq, timestamp, kind))
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (epoch, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!("Scheduler: probe task failed: {}", e);
                continue;
            }
        };

        if halted.is_some() {
            tracing::debug!("Scheduler: discarding outcome for {} after halt", outcome.target);
            continue;
        }

        log_outcome(&outcome);
        let fatal = outcome.kind.is_fatal();
        let target = outcome.target.clone();

        let accepted = lock(registry).record(epoch, &outcome);
        if !accepted {
            // Also covers a stale PermissionDenied: no outcome, so no halt
            tracing::debug!("Scheduler: discarding stale outcome for {}", target);
            continue;
        }
        if events.send(Event::Outcome(outcome)).is_err() {
            halted = Some(StopReason::ConsumerGone);
            continue;
        }

        if fatal {
            let _ = events.send(fatal_event(target));
            halted = Some(StopReason::Fatal);
        }
    }

    halted
}
