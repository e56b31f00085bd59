//! Verity daemon: runs the verification cascade over claims read from stdin.
//!
//! Each non-empty line is one claim. Terminal envelopes (and, with
//! `--progress`, per-stage progress events) are printed to stdout as JSON
//! lines; logs go to stderr. `RUST_LOG` overrides the default `verity=info`
//! filter and `VERITY_LOG_FORMAT=json` switches logs to JSON.

mod cli;
mod simulated;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use cli::Cli;
use simulated::{SimulatedExecutor, SimulatedLoader};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use verity_foundation::{
    ChannelSink, Collaborators, Orchestrator, Outbound, StageExecutors, SysinfoProbe,
};
use verity_kernel::config::CascadeConfig;
use verity_kernel::envelope::{FinalEnvelope, ReasonCode};
use verity_kernel::request::{PipelineRequest, Priority};
use verity_kernel::resource::ResourceProbe;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "verity=debug,verityd=debug" } else { "verity=info,verityd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let json = std::env::var("VERITY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CascadeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = path
                .to_str()
                .ok_or_else(|| anyhow!("config path is not valid UTF-8: {}", path.display()))?;
            CascadeConfig::load(path).with_context(|| format!("loading {path}"))?
        }
        None => CascadeConfig::default(),
    };
    if config.models.is_empty() {
        info!("no model units configured, using the demo set");
        config.models = simulated::demo_models();
    }
    if let Some(workers) = cli.workers {
        config.pipeline.workers = workers;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let priority = Priority::from(cli.priority);

    let (sink, mut rx) = ChannelSink::new();
    let orchestrator = Orchestrator::from_config(
        &config,
        Collaborators {
            loader: Arc::new(SimulatedLoader::default()),
            executors: StageExecutors::uniform(Arc::new(SimulatedExecutor::default())),
            sink: Arc::new(sink),
            probe: (!cli.no_monitor).then(|| Arc::new(SysinfoProbe::new()) as Arc<dyn ResourceProbe>),
        },
    )
    .map_err(|report| anyhow!("{report:?}"))?;
    orchestrator.start();

    let show_progress = cli.progress;
    let printer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let line = match &item {
                Outbound::Final(envelope) => serde_json::to_string(envelope),
                Outbound::Progress(event) if show_progress => serde_json::to_string(event),
                Outbound::Progress(_) => continue,
            };
            match line {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode output"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let claim = line.trim();
                if claim.is_empty() {
                    continue;
                }
                submit(&orchestrator, claim, priority);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    drain(&orchestrator).await;
    orchestrator.shutdown().await;
    let _ = printer.await;

    let stats = orchestrator.stats();
    info!(
        submitted = stats.submitted,
        completed = stats.completed,
        blocked = stats.blocked,
        failed = stats.failed,
        degraded = stats.degraded,
        avg_latency_ms = stats.avg_latency_ms,
        "done"
    );
    Ok(())
}

/// Submits one claim; a rejected claim is answered immediately.
fn submit(orchestrator: &Orchestrator, claim: &str, priority: Priority) {
    let request = PipelineRequest::new(claim, priority);
    match orchestrator.submit_request(request.clone()) {
        Ok(id) => debug!(request_id = %id, "claim submitted"),
        Err(e) => {
            warn!(error = %e, "claim rejected");
            let envelope = FinalEnvelope::rejected(&request, ReasonCode::QueueFull, e.to_string());
            match serde_json::to_string(&envelope) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode output"),
            }
        }
    }
}

/// Waits until every admitted claim has an envelope, or ctrl-c.
async fn drain(orchestrator: &Orchestrator) {
    let settled = || {
        let s = orchestrator.stats();
        s.completed + s.blocked + s.failed >= s.submitted
    };
    tokio::select! {
        _ = async {
            while !settled() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted while draining"),
    }
}
