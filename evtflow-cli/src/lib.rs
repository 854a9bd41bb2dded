#![warn(missing_docs)]
//! evtflow CLI Library
//!
//! Supervisor side of evtflow: configuration, the worker pool, the
//! distributor, the collector and the `evtflow` command line. The same
//! binary doubles as the worker executable when started with `--evt-worker`.
//!
//! # Example
//!
//! ```ignore
//! fn main() {
//!     if let Err(e) = evtflow_cli::run() {
//!         eprintln!("Error: {:#}", e);
//!         std::process::exit(1);
//!     }
//! }
//! ```

mod collector;
mod config;
mod distributor;
mod formatting;
mod pipeline;
mod supervisor;
mod tools;

pub use collector::Collector;
pub use config::*;
pub use distributor::{
    DispatchError, DispatchFailure, DispatchPolicy, DispatchTarget, Distributor, PendingRecord,
};
pub use formatting::{format_human_output, format_ring_stats};
pub use pipeline::{Pipeline, PipelineSettings, interrupted};
pub use supervisor::*;
pub use tools::{
    DrainOptions, DrainReport, FeedOptions, FeedReport, drain, feed, inspect, read_records,
    write_records,
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use evtflow_ipc::DEFAULT_RING_CAPACITY;
use evtflow_logic::OrderingMode;
use std::io::Write;
use std::path::PathBuf;

/// evtflow CLI arguments
#[derive(Parser, Debug)]
#[command(name = "evtflow")]
#[command(
    author,
    version,
    about = "evtflow - shared-memory event distribution across worker processes"
)]
pub struct Cli {
    /// Subcommand; defaults to `run`
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (default: evtflow.toml found walking up from the current directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Summary format
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub format: OutputFormat,

    /// Write the run summary to this file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Internal: Run as worker process (used by supervisor)
    #[arg(long, hide = true)]
    pub evt_worker: bool,
}

/// How the run summary is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table for the terminal
    Human,
    /// Pretty-printed JSON
    Json,
}

/// Overrides for `evtflow run`; unset flags keep the configuration file's value
#[derive(clap::Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Number of worker processes
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Processor the workers run
    #[arg(short, long)]
    pub processor: Option<String>,

    /// Processor argument (repeatable, replaces the configured list)
    #[arg(short = 'a', long = "arg")]
    pub args: Vec<String>,

    /// Input ring name
    #[arg(long)]
    pub input: Option<String>,

    /// Output ring name
    #[arg(long = "output-ring")]
    pub output_ring: Option<String>,

    /// Prefix of per-worker ring names
    #[arg(long)]
    pub worker_prefix: Option<String>,

    /// Ring capacity in bytes
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Ordering mode: strict or best-effort
    #[arg(long)]
    pub mode: Option<OrderingMode>,

    /// Dispatch policy: round-robin or least-loaded
    #[arg(long)]
    pub policy: Option<DispatchPolicy>,

    /// Liveness timeout, e.g. "5s"
    #[arg(long)]
    pub liveness_timeout: Option<String>,

    /// Delivery attempts per event before it is abandoned
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Restarts allowed per worker slot
    #[arg(long)]
    pub max_restarts: Option<u32>,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise workers until the input ends the run (default)
    Run(RunArgs),
    /// Print statistics of a ring
    Inspect {
        /// Ring name
        ring: String,
    },
    /// Push length-prefixed records from a file or stdin into a ring
    Feed {
        /// Ring name
        ring: String,
        /// Input file ("-" or absent for stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Create the ring when it does not exist
        #[arg(long)]
        create: bool,
        /// Capacity in bytes for a created ring
        #[arg(long, default_value_t = DEFAULT_RING_CAPACITY)]
        capacity: usize,
        /// Append an end-of-run record
        #[arg(long)]
        end_of_run: bool,
    },
    /// Pop records from a ring until end-of-run, writing them length-prefixed
    Drain {
        /// Ring name
        ring: String,
        /// Output file ("-" or absent for stdout)
        #[arg(long = "to")]
        to: Option<PathBuf>,
        /// Give up after this long without a record, e.g. "30s"
        #[arg(long)]
        timeout: Option<String>,
        /// Unlink the ring after end-of-run
        #[arg(long)]
        destroy: bool,
    },
    /// Print a default evtflow.toml
    Config,
    /// List registered processors
    Processors,
}

/// Run the evtflow CLI with the process arguments.
///
/// # Returns
/// Returns `Ok(())` on success, or an error if something goes wrong.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the evtflow CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    // Worker mode first, before any supervisor initialization
    if cli.evt_worker {
        return run_worker_mode(cli.verbose);
    }

    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Run(ref args)) => run_pipeline(&cli, args),
        None => run_pipeline(&cli, &RunArgs::default()),
        Some(Commands::Inspect { ref ring }) => {
            print!("{}", tools::inspect(ring)?);
            Ok(())
        }
        Some(Commands::Feed {
            ref ring,
            ref input,
            create,
            capacity,
            end_of_run,
        }) => {
            let mut reader = tools::open_input(input.as_deref())?;
            let options = FeedOptions {
                create,
                capacity,
                end_of_run,
            };
            let report = tools::feed(ring, &mut reader, &options)?;
            eprintln!(
                "fed {} records ({} bytes) into {}{}",
                report.records,
                report.bytes,
                ring,
                if report.end_of_run { ", run ended" } else { "" }
            );
            Ok(())
        }
        Some(Commands::Drain {
            ref ring,
            ref to,
            ref timeout,
            destroy,
        }) => {
            let idle_timeout = timeout
                .as_deref()
                .map(EvtflowConfig::parse_duration)
                .transpose()
                .context("--timeout")?;
            let mut writer = tools::open_output(to.as_deref())?;
            let options = DrainOptions {
                idle_timeout,
                destroy,
            };
            let report = tools::drain(ring, &mut writer, &options)?;
            eprintln!(
                "drained {} records from {} ({} gaps, {} errors)",
                report.records, ring, report.gaps, report.errors
            );
            Ok(())
        }
        Some(Commands::Config) => {
            print!("{}", EvtflowConfig::default_toml());
            Ok(())
        }
        Some(Commands::Processors) => {
            for def in evtflow_core::registered_processors() {
                println!("{:<16} {}", def.name, def.description);
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "evtflow=debug" } else { "evtflow=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run as a worker process (ring + control pipe mode)
fn run_worker_mode(verbose: bool) -> anyhow::Result<()> {
    init_logging(verbose);
    let code = evtflow_core::run_worker();
    std::process::exit(code);
}

/// Layer evtflow.toml (or defaults) and CLI overrides, then run the pipeline
fn run_pipeline(cli: &Cli, args: &RunArgs) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => EvtflowConfig::load(path)?,
        None => EvtflowConfig::discover().unwrap_or_default(),
    };
    apply_overrides(&mut config, args);
    let settings = config.resolve()?;

    let pipeline = Pipeline::new(settings).context("setting up rings")?;
    let summary = pipeline.run()?;

    let rendered = match cli.format {
        OutputFormat::Human => format_human_output(&summary),
        OutputFormat::Json => serde_json::to_string_pretty(&summary)? + "\n",
    };
    match &cli.output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
            stdout.flush()?;
        }
    }

    if !summary.is_lossless() {
        tracing::warn!(
            abandoned = summary.abandoned.len(),
            gaps = summary.gapped.len(),
            "run finished with lost events"
        );
    }
    Ok(())
}

/// CLI flags win over file values
fn apply_overrides(config: &mut EvtflowConfig, args: &RunArgs) {
    if let Some(workers) = args.workers {
        config.pool.workers = workers;
        config.pool.min_workers = config.pool.min_workers.min(workers);
    }
    if let Some(processor) = &args.processor {
        config.worker.processor = processor.clone();
    }
    if !args.args.is_empty() {
        config.worker.args = args.args.clone();
    }
    if let Some(input) = &args.input {
        config.rings.input = input.clone();
    }
    if let Some(output) = &args.output_ring {
        config.rings.output = output.clone();
    }
    if let Some(prefix) = &args.worker_prefix {
        config.rings.worker_prefix = prefix.clone();
    }
    if let Some(capacity) = args.capacity {
        config.rings.capacity = capacity;
    }
    if let Some(mode) = args.mode {
        config.collector.mode = mode;
    }
    if let Some(policy) = args.policy {
        config.pool.policy = policy;
    }
    if let Some(timeout) = &args.liveness_timeout {
        config.pool.liveness_timeout = timeout.clone();
    }
    if let Some(attempts) = args.max_attempts {
        config.pool.max_attempts = attempts;
    }
    if let Some(restarts) = args.max_restarts {
        config.pool.max_restarts = restarts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "evtflow",
            "run",
            "--workers",
            "3",
            "--processor",
            "chaos",
            "--arg",
            "exit-on=4",
            "--arg",
            "once=/tmp/marker",
            "--mode",
            "best-effort",
            "--policy",
            "least-loaded",
        ])
        .unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        let mut config = EvtflowConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.worker.processor, "chaos");
        assert_eq!(config.worker.args, vec!["exit-on=4", "once=/tmp/marker"]);
        assert_eq!(config.collector.mode, OrderingMode::BestEffort);
        assert_eq!(config.pool.policy, DispatchPolicy::LeastLoaded);
    }

    #[test]
    fn test_workers_override_caps_min_workers() {
        let mut config = EvtflowConfig::default();
        config.pool.min_workers = 4;
        config.pool.workers = 8;
        apply_overrides(
            &mut config,
            &RunArgs {
                workers: Some(2),
                ..RunArgs::default()
            },
        );
        assert_eq!(config.pool.min_workers, 2);
    }

    #[test]
    fn test_hidden_worker_flag() {
        let cli = Cli::try_parse_from(["evtflow", "--evt-worker"]).unwrap();
        assert!(cli.evt_worker);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_global_format_flag() {
        let cli = Cli::try_parse_from(["evtflow", "run", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
    }
}
