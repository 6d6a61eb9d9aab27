//! f1-poller: incremental OpenF1 poller.
//!
//! Usage:
//!   f1-poller [OPTIONS] [run|daemon]
//!
//! Options:
//!   -c, --config <FILE>        Config file path (default: config/poller.toml)
//!   --base-url <URL>           Upstream base URL (overrides config)
//!   --sink-stream <ID>         Sink stream identifier (overrides config)
//!   --state-key <KEY>          State store key (overrides config)
//!
//! `run` performs a single invocation and exits; `daemon` triggers an
//! invocation every `trigger.interval_secs` until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use f1_common::ClickHouseClient;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use f1_poller::config::{PollerConfig, SinkKind};
use f1_poller::controller::{InvocationReport, PollController};
use f1_poller::sink::{ClickHouseSink, JsonLinesSink, RecordSink};
use f1_poller::state::{FileStateStore, StateStore};
use f1_poller::upstream::OpenF1Client;

/// CLI arguments for f1-poller.
#[derive(Parser, Debug)]
#[command(name = "f1-poller")]
#[command(about = "Incremental OpenF1 poller forwarding live telemetry to a record sink")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/poller.toml")]
    config: PathBuf,

    /// Upstream base URL (overrides config file)
    #[arg(long)]
    base_url: Option<String>,

    /// Sink stream identifier (overrides config file)
    #[arg(long)]
    sink_stream: Option<String>,

    /// State store key (overrides config file)
    #[arg(long)]
    state_key: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run a single invocation and exit
    Run,
    /// Trigger invocations periodically until stopped
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        PollerConfig::from_file(&args.config)?
    } else {
        eprintln!("Config file not found at {:?}, using defaults", args.config);
        PollerConfig::default()
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(args.base_url, args.sink_stream, args.state_key);
    config.validate().context("Invalid configuration")?;

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting f1-poller");
    info!("Upstream: {}", config.upstream.base_url);
    info!("Sink: {:?} -> {}", config.sink.kind, config.sink_stream());
    info!("State key: {}", config.state_key());

    let upstream = Arc::new(
        OpenF1Client::new(&config.upstream.base_url, config.upstream.request_timeout)
            .context("Failed to build upstream client")?,
    );
    let sink = build_sink(&config).await;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.state_key()));

    let controller = Arc::new(PollController::new(&config, upstream, sink, store));

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let report = controller.run_invocation().await?;
            log_report(&report);
            Ok(())
        }
        Command::Daemon => run_daemon(controller, &config).await,
    }
}

/// Builds the configured record sink.
async fn build_sink(config: &PollerConfig) -> Arc<dyn RecordSink> {
    match config.sink.kind {
        SinkKind::ClickHouse => {
            let client = ClickHouseClient::new(config.sink.clickhouse.clone());
            let sink = ClickHouseSink::new(client, config.sink_stream(), config.sink.max_batch_size);

            info!("Testing ClickHouse connection...");
            if let Err(e) = sink.prepare().await {
                warn!(
                    "ClickHouse not available: {}. Continuing anyway, batches will be dropped until it is.",
                    e
                );
            }
            Arc::new(sink)
        }
        SinkKind::Jsonl => Arc::new(JsonLinesSink::new(
            config.sink_stream(),
            config.sink.max_batch_size,
        )),
    }
}

/// Triggers an invocation every `trigger_interval`. Invocations may overlap.
async fn run_daemon(controller: Arc<PollController>, config: &PollerConfig) -> Result<()> {
    info!(
        "Daemon mode: invocation every {}s",
        config.trigger_interval.as_secs()
    );

    let mut ticker = interval(config.trigger_interval);
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    #[cfg(unix)]
    let shutdown = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        Ok::<(), std::io::Error>(())
    };

    #[cfg(windows)]
    let shutdown = async {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        Ok::<(), std::io::Error>(())
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                in_flight.retain(|handle| !handle.is_finished());
                if !in_flight.is_empty() {
                    info!("{} invocation(s) still running, starting another", in_flight.len());
                }

                let controller = Arc::clone(&controller);
                in_flight.push(tokio::spawn(async move {
                    match controller.run_invocation().await {
                        Ok(report) => log_report(&report),
                        Err(e) => error!("Invocation failed: {}", e),
                    }
                }));
            }
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    info!("Initiating graceful shutdown...");
    let shutdown_timeout = config.polling.invocation_budget;
    let pending = in_flight.len();

    tokio::select! {
        _ = async {
            for handle in in_flight {
                let _ = handle.await;
            }
        } => {
            info!("All invocations completed");
        }
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Shutdown timeout exceeded with {} invocation(s) pending, forcing exit", pending);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn log_report(report: &InvocationReport) {
    let Some(session_key) = report.session_key.as_deref() else {
        info!("No active session");
        return;
    };

    let emitted = report.emit_totals();
    info!(
        "Session {}: {} cycles ({:?}), fetched {}, sent {}/{}, endpoint failures {}",
        session_key,
        report.cycles.len(),
        report.outcome,
        report.records_fetched(),
        emitted.sent,
        emitted.envelopes,
        report.endpoint_failures()
    );

    let sink_failures = report.cycles_with_sink_failures();
    if !sink_failures.is_empty() {
        warn!("Sink failures in cycles {:?}", sink_failures);
    }
}
