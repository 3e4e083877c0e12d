//! Scripted prober and event helpers for scheduler tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{lock, Event};
use crate::probe::{OutcomeKind, ProbeOutcome, Prober, Target};

/// Returns scripted outcomes per target, then a fallback.
pub(crate) struct ScriptedProber {
    scripts: Mutex<HashMap<String, VecDeque<OutcomeKind>>>,
    delays: HashMap<String, Duration>,
    fallback: OutcomeKind,
    calls: Mutex<Vec<Target>>,
}

impl ScriptedProber {
    pub(crate) fn new(fallback: OutcomeKind) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn script(self, target: &str, kinds: Vec<OutcomeKind>) -> Self {
        lock(&self.scripts).insert(target.to_string(), kinds.into());
        self
    }

    pub(crate) fn delay(mut self, target: &str, delay: Duration) -> Self {
        self.delays.insert(target.to_string(), delay);
        self
    }

    pub(crate) fn calls_for(&self, target: &str) -> usize {
        lock(&self.calls).iter().filter(|t| t.as_str() == target).count()
    }
}

impl Prober for ScriptedProber {
    fn probe(&self, target: &Target, _timeout: Duration) -> OutcomeKind {
        lock(&self.calls).push(target.clone());
        if let Some(delay) = self.delays.get(target.as_str()) {
            std::thread::sleep(*delay);
        }
        lock(&self.scripts)
            .get_mut(target.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub(crate) fn ok(latency_ms: f64) -> OutcomeKind {
    OutcomeKind::Success { latency_ms }
}

pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub(crate) async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<Event>) -> ProbeOutcome {
    match next_event(rx).await {
        Event::Outcome(outcome) => outcome,
        other => panic!("expected outcome, got {:?}", other),
    }
}

/// Drain events already queued, which after `stop()` ends with `Finished`.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
