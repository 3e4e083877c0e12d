//! pingtrail - continuous ping monitor for one or many hosts.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pingtrail::config::{self, ProbeSettings};
use pingtrail::probe::{IcmpProber, ProbeOutcome, Prober, Target};
use pingtrail::scheduler::{Event, MultiTargetScheduler, ProbeLoop, StopReason};
use pingtrail::stats::{self, StatsSnapshot, SummaryRow};

type BoxError = Box<dyn Error + Send + Sync>;

/// pingtrail - watch host reachability and latency until interrupted.
#[derive(Debug, Parser)]
#[command(name = "pingtrail", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ping a single host continuously.
    Ping {
        /// Hostname or IP address.
        host: String,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Ping a list of hosts once per cycle.
    Test {
        /// Hostnames or IP addresses.
        hosts: Vec<String>,

        /// File with one host per line (`#` starts a comment).
        #[arg(long = "hosts-file")]
        hosts_file: Option<PathBuf>,

        /// Concurrent probes within one cycle.
        #[arg(long = "max-in-flight")]
        max_in_flight: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Seconds between probes (overrides PINGTRAIL_INTERVAL).
    #[arg(long)]
    interval: Option<f64>,

    /// Seconds to wait for each reply (overrides PINGTRAIL_TIMEOUT).
    #[arg(long)]
    timeout: Option<f64>,

    /// Stop after this many probes per host.
    #[arg(long)]
    count: Option<u64>,

    /// Print outcomes and the summary as JSON lines.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Write recorded results as CSV to this path on exit.
    #[arg(long)]
    export: Option<PathBuf>,

    /// Use the system ping command when raw ICMP is not permitted.
    #[arg(long = "command-fallback", default_value_t = false)]
    command_fallback: bool,
}

impl RunArgs {
    /// Layer CLI flags over environment configuration.
    fn settings(&self, base: ProbeSettings) -> Result<ProbeSettings, BoxError> {
        let mut settings = base.load();
        if let Some(secs) = self.interval {
            settings.interval = config::seconds(secs)?;
        }
        if let Some(secs) = self.timeout {
            settings.timeout = config::seconds(secs)?;
        }
        if self.command_fallback {
            settings.command_fallback = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Logs go to stderr so stdout carries only results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pingtrail=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Ping { host, run } => ping(host, run).await,
        Command::Test {
            hosts,
            hosts_file,
            max_in_flight,
            run,
        } => {
            let mut targets = hosts;
            if let Some(path) = hosts_file {
                targets.extend(read_hosts(&path)?);
            }
            let mut settings = run.settings(ProbeSettings::multi_target())?;
            if let Some(n) = max_in_flight {
                settings.max_in_flight = n;
            }
            test(targets, settings, run).await
        }
    }
}

async fn ping(host: String, run: RunArgs) -> Result<(), BoxError> {
    let settings = run.settings(ProbeSettings::default())?;
    let prober: Arc<dyn Prober> = Arc::new(IcmpProber::new().with_command_fallback(settings.command_fallback));

    let (probe_loop, mut rx) = ProbeLoop::new(prober, settings.clone());
    probe_loop.start(host.as_str(), settings.interval)?;

    let mut report = Report::new(run.json, false);
    let ended = consume(&mut rx, &mut report, run.count, 1).await;
    probe_loop.stop().await;
    let reason = report.drain(&mut rx).or(ended);

    if let Some(snapshot) = probe_loop.stats() {
        report.summary(&Target::from(host), &snapshot);
    }

    if let Some(path) = &run.export {
        match stats::export_history(path, &probe_loop.history()) {
            Ok(()) => tracing::info!("Exported history to {}", path.display()),
            Err(e) => tracing::error!("Failed to export history to {}: {}", path.display(), e),
        }
    }

    finish(reason, &report)
}

async fn test(hosts: Vec<String>, settings: ProbeSettings, run: RunArgs) -> Result<(), BoxError> {
    let prober: Arc<dyn Prober> = Arc::new(IcmpProber::new().with_command_fallback(settings.command_fallback));
    let (scheduler, mut rx) = MultiTargetScheduler::new(prober, settings);

    for host in hosts {
        if !scheduler.add_target(host.as_str()) {
            tracing::warn!("Ignoring duplicate host {}", host);
        }
    }
    scheduler.start()?;

    let mut report = Report::new(run.json, true);
    let expected = scheduler.targets().len();
    let ended = consume(&mut rx, &mut report, run.count, expected).await;
    scheduler.stop().await;
    let reason = report.drain(&mut rx).or(ended);

    let snapshot = scheduler.snapshot();
    for (target, stats) in &snapshot {
        report.summary(target, stats);
    }

    if let Some(path) = &run.export {
        let rows: Vec<SummaryRow> = snapshot
            .into_iter()
            .map(|(target, snapshot)| SummaryRow {
                status: report.status(&target).to_string(),
                target,
                snapshot,
            })
            .collect();
        match stats::export_summary(path, &rows) {
            Ok(()) => tracing::info!("Exported summary to {}", path.display()),
            Err(e) => tracing::error!("Failed to export summary to {}: {}", path.display(), e),
        }
    }

    finish(reason, &report)
}

/// Print events until the run finishes, Ctrl-C, or every target reached `count`.
///
/// Returns the stop reason if the run finished on its own.
async fn consume(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    report: &mut Report,
    count: Option<u64>,
    targets: usize,
) -> Option<StopReason> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut done: HashSet<Target> = HashSet::new();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    return None;
                };
                if let Event::Finished { reason } = event {
                    return Some(reason);
                }
                if let Some(outcome) = report.event(&event) {
                    if count.is_some_and(|n| outcome.seq >= n) {
                        done.insert(outcome.target.clone());
                    }
                }
                if count.is_some() && done.len() >= targets {
                    return None;
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, stopping");
                return None;
            }
        }
    }
}

fn finish(reason: Option<StopReason>, report: &Report) -> Result<(), BoxError> {
    match (reason, &report.fatal) {
        (Some(StopReason::Fatal), Some(detail)) => Err(detail.clone().into()),
        _ => Ok(()),
    }
}

/// Renders events as table rows or JSON lines.
struct Report {
    json: bool,
    multi: bool,
    last_status: HashMap<Target, &'static str>,
    fatal: Option<String>,
}

impl Report {
    fn new(json: bool, multi: bool) -> Self {
        Self {
            json,
            multi,
            last_status: HashMap::new(),
            fatal: None,
        }
    }

    /// Print one event; returns the outcome it carried, if any.
    fn event<'a>(&mut self, event: &'a Event) -> Option<&'a ProbeOutcome> {
        match event {
            Event::Started => None,
            Event::Outcome(outcome) => {
                self.outcome(outcome);
                Some(outcome)
            }
            Event::Fatal { target, detail } => {
                eprintln!("error: {}: {}", target, detail);
                self.fatal = Some(detail.clone());
                None
            }
            Event::Finished { .. } => None,
        }
    }

    fn outcome(&mut self, outcome: &ProbeOutcome) {
        self.last_status
            .insert(outcome.target.clone(), outcome.kind.status_text());

        if self.json {
            match serde_json::to_string(outcome) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!("Failed to encode outcome: {}", e),
            }
            return;
        }

        let time = outcome.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
        let result = match outcome.kind.latency_ms() {
            Some(ms) => format!("{:.1} ms", ms),
            None => outcome.kind.status_text().to_string(),
        };
        if self.multi {
            println!("{:<32} {:>6}  {}  {}", outcome.target, outcome.seq, time, result);
        } else {
            println!("{:>6}  {}  {}", outcome.seq, time, result);
        }

        if let Some(warning) = outcome.kind.warning() {
            eprintln!("warning: {}: {}", outcome.target, warning);
        }
    }

    /// Print events queued before the run finished; returns its stop reason.
    fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<StopReason> {
        let mut reason = None;
        while let Ok(event) = rx.try_recv() {
            if let Event::Finished { reason: r } = event {
                reason = Some(r);
            } else {
                self.event(&event);
            }
        }
        reason
    }

    fn status(&self, target: &Target) -> &'static str {
        self.last_status.get(target).copied().unwrap_or("Pending")
    }

    fn summary(&self, target: &Target, snapshot: &StatsSnapshot) {
        if self.json {
            let line = serde_json::json!({ "target": target, "summary": snapshot });
            println!("{}", line);
            return;
        }

        println!();
        println!("--- {} statistics ---", target);
        println!(
            "{} sent, {} received, {:.1}% loss",
            snapshot.sent, snapshot.received, snapshot.loss_pct
        );
        if let (Some(min), Some(mean), Some(max)) = (snapshot.min_ms, snapshot.mean_ms, snapshot.max_ms) {
            println!("min/mean/max = {:.1}/{:.1}/{:.1} ms", min, mean, max);
        }
        if let (Some(p50), Some(p95)) = (snapshot.p50_ms, snapshot.p95_ms) {
            println!("p50/p95 = {:.1}/{:.1} ms", p50, p95);
        }
    }
}

fn read_hosts(path: &Path) -> Result<Vec<String>, BoxError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read hosts file {}: {}", path.display(), e))?;
    Ok(parse_hosts(&content))
}

fn parse_hosts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts_skips_comments_and_blanks() {
        let content = "# lab hosts\n10.0.0.1\n\n  example.com  # web\n#disabled\n::1\n";
        assert_eq!(parse_hosts(content), vec!["10.0.0.1", "example.com", "::1"]);
    }

    #[test]
    fn test_cli_flags_override_settings() {
        let cli = Cli::parse_from(["pingtrail", "test", "a", "b", "--interval", "0.5", "--max-in-flight", "4"]);
        let Command::Test {
            hosts,
            max_in_flight,
            run,
            ..
        } = cli.command
        else {
            panic!("expected test command");
        };
        assert_eq!(hosts, vec!["a", "b"]);
        assert_eq!(max_in_flight, Some(4));

        let settings = run.settings(ProbeSettings::multi_target()).unwrap();
        assert_eq!(settings.interval, std::time::Duration::from_millis(500));
        assert!(run.settings(ProbeSettings::default()).is_ok());
    }

    #[test]
    fn test_invalid_interval_is_rejected() {
        let cli = Cli::parse_from(["pingtrail", "ping", "h", "--interval", "0"]);
        let Command::Ping { run, .. } = cli.command else {
            panic!("expected ping command");
        };
        assert!(run.settings(ProbeSettings::default()).is_err());
    }
}
