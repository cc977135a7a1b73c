use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use liveset_controller::{ChangeObserver, ControllerOptions, ResultSetController};
use liveset_core::{ChangeEvent, Snapshot};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod scenario;

use scenario::{Scenario, Step};

#[derive(Parser, Debug)]
#[command(name = "livesetctl", version, about = "Replay live result-set scenarios")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch the scenario query over its seed records and print the sections
    Show {
        /// Scenario file (JSON)
        scenario: PathBuf,
    },
    /// Run every scripted step and print the change batches each one produced
    Replay {
        /// Scenario file (JSON)
        scenario: PathBuf,
    },
}

/// Logs go to stderr so `-o json` output stays clean on stdout.
fn init_tracing() {
    let directives = std::env::var("LIVESET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_str(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn metrics_addr(raw: Option<&str>) -> Option<SocketAddr> {
    let raw = raw?;
    match raw.trim().parse::<SocketAddr>() {
        Ok(sock) => Some(sock),
        Err(_) => {
            warn!(addr = %raw, "livesetctl: LIVESET_METRICS_ADDR is not host:port; metrics disabled");
            None
        }
    }
}

/// Prometheus exporter on `LIVESET_METRICS_ADDR`, when it is a socket address.
fn init_metrics() {
    let Some(sock) = metrics_addr(std::env::var("LIVESET_METRICS_ADDR").ok().as_deref()) else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "livesetctl: serving metrics"),
        Err(e) => warn!(error = %e, addr = %sock, "livesetctl: metrics exporter not installed"),
    }
}

fn settle_wait() -> Duration {
    let secs = std::env::var("LIVESET_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(5);
    Duration::from_secs(secs)
}

/// Collects every published batch until taken.
#[derive(Default)]
struct Recorder(Mutex<Vec<Vec<ChangeEvent>>>);

impl Recorder {
    fn take(&self) -> Vec<Vec<ChangeEvent>> { std::mem::take(&mut *self.0.lock().unwrap_or_else(|p| p.into_inner())) }
}

impl ChangeObserver for Recorder {
    fn will_change_content(&self) { self.0.lock().unwrap_or_else(|p| p.into_inner()).push(Vec::new()) }

    fn on_event(&self, event: &ChangeEvent) {
        let mut batches = self.0.lock().unwrap_or_else(|p| p.into_inner());
        match batches.last_mut() {
            Some(batch) => batch.push(event.clone()),
            None => batches.push(vec![event.clone()]),
        }
    }
}

#[derive(Debug, Serialize)]
struct StepReport {
    step: usize,
    action: &'static str,
    batches: Vec<Vec<ChangeEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct Replay {
    initial: Arc<Snapshot>,
    steps: Vec<StepReport>,
    last: Arc<Snapshot>,
}

/// Waits until the controller has processed `target` notifications.
async fn settle(rx: &mut watch::Receiver<u64>, target: u64, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    while *rx.borrow() < target {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match tokio::time::timeout(deadline - now, rx.changed()).await {
            Ok(Ok(())) => {}
            _ => return false,
        }
    }
    true
}

async fn replay(scenario: &Scenario, wait: Duration) -> Result<Replay> {
    let store = Arc::new(scenario.build_store()?);
    let options = ControllerOptions { verify_sections: true, ..ControllerOptions::default() };
    let ctl = ResultSetController::with_options(Arc::clone(&store), scenario.query.clone(), options);
    let recorder = Arc::new(Recorder::default());
    let _observer = ctl.register_observer(recorder.clone())?;
    ctl.perform_fetch().await?;
    let initial = ctl.snapshot()?;
    let mut epoch = ctl.subscribe_epoch();

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (i, step) in scenario.steps.iter().enumerate() {
        let seen = *epoch.borrow();
        let outcome = match step {
            Step::Refresh(def) => ctl.refresh(def.to_refresh()).await.map_err(anyhow::Error::from),
            write => match write.apply(&store) {
                Ok(Some(change)) if !change.is_empty() => {
                    if !settle(&mut epoch, seen + 1, wait).await {
                        warn!(step = i + 1, "replay: notification not processed in time");
                    }
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
        };
        let error = outcome.err().map(|e| format!("{e:#}"));
        if let Some(e) = &error {
            warn!(step = i + 1, action = step.name(), error = %e, "replay: step failed");
        }
        steps.push(StepReport { step: i + 1, action: step.name(), batches: recorder.take(), error });
    }
    let last = ctl.snapshot()?;
    ctl.dispose()?;
    info!(steps = steps.len(), records = last.len(), "replay: done");
    Ok(Replay { initial, steps, last })
}

async fn show(scenario: &Scenario) -> Result<Arc<Snapshot>> {
    let store = Arc::new(scenario.build_store()?);
    let ctl = ResultSetController::new(store, scenario.query.clone());
    ctl.perform_fetch().await?;
    Ok(ctl.snapshot()?)
}

fn print_snapshot(snap: &Snapshot) {
    println!("SECTION              TITLE  COUNT");
    for (i, sec) in snap.sections().iter().enumerate() {
        let name = if sec.name.is_empty() { "-" } else { sec.name.as_str() };
        println!("{:<20} {:<6} {}", name, sec.index_title, sec.len);
        for r in snap.section_records(i).unwrap_or_default() {
            let fields: Vec<String> = r.values().iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!("  {:<6} {}", r.id().to_string(), fields.join(" "));
        }
    }
}

fn snapshot_json(snap: &Snapshot) -> serde_json::Value {
    serde_json::json!({ "sections": snap.sections(), "records": snap.records() })
}

fn load(path: &Path) -> Result<Scenario> {
    let scenario = Scenario::load(path)?;
    info!(path = %path.display(), entities = scenario.entities.len(), seed = scenario.seed.len(), steps = scenario.steps.len(), "livesetctl: scenario loaded");
    Ok(scenario)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Show { scenario } => {
            let snap = show(&load(&scenario)?).await?;
            match cli.output {
                Output::Human => print_snapshot(&snap),
                Output::Json => println!("{}", serde_json::to_string_pretty(&snapshot_json(&snap))?),
            }
        }
        Commands::Replay { scenario } => {
            let run = replay(&load(&scenario)?, settle_wait()).await?;
            match cli.output {
                Output::Human => {
                    print_snapshot(&run.initial);
                    for s in &run.steps {
                        println!("step {} {}", s.step, s.action);
                        if let Some(e) = &s.error {
                            println!("  error: {e}");
                        }
                        for batch in &s.batches {
                            println!("  batch");
                            for event in batch {
                                println!("    {event}");
                            }
                        }
                    }
                    print_snapshot(&run.last);
                }
                Output::Json => {
                    let out = serde_json::json!({
                        "initial": snapshot_json(&run.initial),
                        "steps": run.steps,
                        "final": snapshot_json(&run.last),
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
    }
    Ok(())
}
