//! `holo-probe`: write a dense sequence across replicated nodes and verify
//! each node holds every value exactly once.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use holo_probe::config::parse_list;
use holo_probe::graphql::GraphqlGateway;
use holo_probe::memory::MemoryGateway;
use holo_probe::{Node, Probe, ProbeConfig};
use tokio_util::sync::CancellationToken;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-probe")]
struct Args {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the sequence and validate every node.
    Run(RunArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// GraphQL over HTTP at `<node>/graphql`.
    Graphql,
    /// In-process nodes, for smoke runs without a cluster.
    Memory,
}

/// CLI options for a probe run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Comma-separated node base URLs, e.g. `http://localhost:8080,http://localhost:8081`
    #[arg(long, default_value = "")]
    nodes: String,

    #[arg(long, value_enum, default_value_t = Backend::Graphql)]
    backend: Backend,

    /// Number of concurrent writers.
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Per-writer pacing between writes.
    #[arg(long, default_value = "100ms")]
    interval: humantime::Duration,

    /// Write values `[0, max-events)` and stop.
    #[arg(long, default_value_t = 100_000)]
    max_events: u64,

    /// Validate every node each time this many more values are reserved.
    #[arg(long, default_value_t = 2_500)]
    validation_interval: u64,

    /// How often to check whether a validation is due.
    #[arg(long, default_value = "2s")]
    validation_poll: humantime::Duration,

    /// Records fetched per page during validation.
    #[arg(long, default_value_t = 1_000)]
    page_size: usize,

    /// Comma-separated, pre-seeded entity ids records link to.
    #[arg(long, default_value = "Alice,Bob,Charlie,David,Eve")]
    entities: String,

    /// Per-call timeout for every backend request.
    #[arg(long, default_value = "30s")]
    op_timeout: humantime::Duration,

    /// Interval between progress lines.
    #[arg(long, default_value = "10s")]
    report_interval: humantime::Duration,

    /// Metrics listen address; empty disables the endpoint.
    #[arg(long, default_value = "0.0.0.0:3020")]
    metrics_addr: String,

    /// Directory for per-worker `error-<id>.log` files.
    #[arg(long, default_value = ".")]
    error_log_dir: PathBuf,

    /// Fixed seed for node and entity choice (0 draws each worker's stream
    /// from entropy).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into());
    match format {
        LogFormat::Text => {
            // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
            let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
            tracing_subscriber::fmt()
                .with_ansi(ansi)
                .with_env_filter(filter)
                .compact()
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
    }
}

fn build_config(args: &RunArgs) -> anyhow::Result<ProbeConfig> {
    let mut nodes = parse_list(&args.nodes);
    if nodes.is_empty() && args.backend == Backend::Memory {
        nodes = (0..3).map(|i| format!("memory-{i}")).collect();
    }

    let metrics_addr = match args.metrics_addr.trim() {
        "" => None,
        addr => Some(
            addr.parse::<SocketAddr>()
                .with_context(|| format!("invalid metrics address {addr:?}"))?,
        ),
    };

    let seed = (args.seed != 0).then_some(args.seed);
    match seed {
        Some(seed) => tracing::info!(seed, "node and entity choice seeded"),
        None => tracing::info!("node and entity choice seeded from entropy"),
    }

    let config = ProbeConfig {
        nodes,
        workers: args.workers,
        interval: args.interval.into(),
        max_events: args.max_events,
        validation_interval: args.validation_interval,
        validation_poll: args.validation_poll.into(),
        page_size: args.page_size,
        entities: parse_list(&args.entities),
        op_timeout: args.op_timeout.into(),
        report_interval: args.report_interval.into(),
        metrics_addr,
        error_log_dir: args.error_log_dir.clone(),
        seed,
    };
    config.validate()?;
    Ok(config)
}

fn build_nodes(backend: Backend, config: &ProbeConfig) -> anyhow::Result<Vec<Node>> {
    // In-process nodes replicate one shared store, like a real cluster.
    let memory = MemoryGateway::new("memory");
    config
        .nodes
        .iter()
        .map(|addr| -> anyhow::Result<Node> {
            Ok(match backend {
                // Every writer may target any node, so size each pool for all of them.
                Backend::Graphql => Arc::new(
                    GraphqlGateway::new(addr, config.workers, config.op_timeout)
                        .with_context(|| format!("gateway for {addr}"))?,
                ),
                Backend::Memory => Arc::new(memory.replica(addr.clone())),
            })
        })
        .collect()
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;
    let nodes = build_nodes(args.backend, &config)?;
    let probe = Probe::new(config, nodes)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping writers");
                cancel.cancel();
            }
        });
    }

    let summary = probe.run(cancel).await?;
    for report in &summary.final_reports {
        eprintln!(
            "{}: {} aggregate={} seen={} outOfRange={} missed={}",
            report.node,
            report.verdict,
            report.high_water_mark,
            report.count_seen,
            report.out_of_range,
            report.missing_count()
        );
    }
    anyhow::ensure!(summary.passed(), "final validation did not pass on every node");
    Ok(())
}
