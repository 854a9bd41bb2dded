//! Configuration loading from evtflow.toml
//!
//! The supervisor reads an `evtflow.toml` file, discovered by walking up from
//! the current directory unless `--config` names one. Command line flags
//! override file values; see [`crate::Cli`].

use crate::distributor::DispatchPolicy;
use crate::pipeline::PipelineSettings;
use crate::supervisor::PoolSettings;
use anyhow::{Context, bail};
use evtflow_ipc::DEFAULT_RING_CAPACITY;
use evtflow_logic::{OrderingMode, ReorderConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up by [`EvtflowConfig::discover`]
pub const CONFIG_FILE: &str = "evtflow.toml";

/// evtflow configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvtflowConfig {
    /// Ring names and sizes
    #[serde(default)]
    pub rings: RingsConfig,
    /// Worker pool
    #[serde(default)]
    pub pool: PoolConfig,
    /// Output ordering
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Event loop timing
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Processor run by every worker
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Ring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingsConfig {
    /// Input ring the supervisor pulls from
    #[serde(default = "default_input")]
    pub input: String,
    /// Output ring results are emitted on
    #[serde(default = "default_output")]
    pub output: String,
    /// Prefix of per-worker rings (`{prefix}.{worker}.in` / `.out`)
    #[serde(default = "default_worker_prefix")]
    pub worker_prefix: String,
    /// Capacity in bytes of every ring the supervisor creates
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for RingsConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            output: default_output(),
            worker_prefix: default_worker_prefix(),
            capacity: default_capacity(),
        }
    }
}

fn default_input() -> String {
    "evtflow.input".to_string()
}
fn default_output() -> String {
    "evtflow.output".to_string()
}
fn default_worker_prefix() -> String {
    "evtflow".to_string()
}
fn default_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker processes (fixed for the run)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Fewer ready workers than this at start-up aborts the run
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Dispatch policy: "round-robin" or "least-loaded"
    #[serde(default)]
    pub policy: DispatchPolicy,
    /// Time a new worker has to say hello (e.g., "10s")
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: String,
    /// Silence or in-flight age after which a worker is declared dead
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: String,
    /// Heartbeat interval requested from workers
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
    /// Restarts allowed per worker slot
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Delay between a death and the respawn
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff: String,
    /// Dispatches of one event before it is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Events in flight per worker; 0 means bounded only by ring space
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Worker executable; defaults to the running binary
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
    /// Pin worker N to the N-th available CPU
    #[serde(default)]
    pub pin_cpus: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            min_workers: default_min_workers(),
            policy: DispatchPolicy::default(),
            startup_timeout: default_startup_timeout(),
            liveness_timeout: default_liveness_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            max_restarts: default_max_restarts(),
            restart_backoff: default_restart_backoff(),
            max_attempts: default_max_attempts(),
            max_in_flight: default_max_in_flight(),
            worker_binary: None,
            pin_cpus: false,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_min_workers() -> usize {
    1
}
fn default_startup_timeout() -> String {
    "10s".to_string()
}
fn default_liveness_timeout() -> String {
    "30s".to_string()
}
fn default_heartbeat_interval() -> String {
    "500ms".to_string()
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_backoff() -> String {
    "200ms".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_in_flight() -> usize {
    64
}

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Ordering mode: "strict" or "best-effort"
    #[serde(default)]
    pub mode: OrderingMode,
    /// Buffered results the head of line may hold back without time limit
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,
    /// How long the head of line may block an overflowing window
    #[serde(default = "default_reorder_timeout")]
    pub reorder_timeout: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            mode: OrderingMode::default(),
            reorder_window: default_reorder_window(),
            reorder_timeout: default_reorder_timeout(),
        }
    }
}

fn default_reorder_window() -> usize {
    1024
}
fn default_reorder_timeout() -> String {
    "30s".to_string()
}

/// Event loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sleep between idle loop iterations
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// Give up on in-flight work this long after the last completion once draining
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_poll_interval() -> String {
    "1ms".to_string()
}
fn default_drain_timeout() -> String {
    "60s".to_string()
}

/// Processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Registered processor name
    #[serde(default = "default_processor")]
    pub processor: String,
    /// Processor arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            processor: default_processor(),
            args: Vec::new(),
        }
    }
}

fn default_processor() -> String {
    "passthrough".to_string()
}

impl EvtflowConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!("ignoring {}: {:#}", config_path.display(), e);
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Turn the file representation into validated runtime settings
    pub fn resolve(&self) -> anyhow::Result<PipelineSettings> {
        let pool = &self.pool;
        if pool.workers == 0 {
            bail!("pool.workers must be at least 1");
        }
        if pool.min_workers > pool.workers {
            bail!(
                "pool.min_workers ({}) exceeds pool.workers ({})",
                pool.min_workers,
                pool.workers
            );
        }
        if pool.max_attempts == 0 {
            bail!("pool.max_attempts must be at least 1");
        }

        let liveness_timeout = Self::parse_duration(&pool.liveness_timeout)
            .context("pool.liveness_timeout")?;
        let heartbeat_interval = Self::parse_duration(&pool.heartbeat_interval)
            .context("pool.heartbeat_interval")?;
        if heartbeat_interval.is_zero() || heartbeat_interval >= liveness_timeout {
            bail!(
                "pool.heartbeat_interval ({:?}) must be non-zero and shorter than pool.liveness_timeout ({:?})",
                heartbeat_interval,
                liveness_timeout
            );
        }

        let worker_binary = match &pool.worker_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("locating the worker binary")?,
        };

        Ok(PipelineSettings {
            input_ring: self.rings.input.clone(),
            output_ring: self.rings.output.clone(),
            capacity: self.rings.capacity,
            pool: PoolSettings {
                workers: pool.workers,
                min_workers: pool.min_workers,
                worker_prefix: self.rings.worker_prefix.clone(),
                ring_capacity: self.rings.capacity,
                startup_timeout: Self::parse_duration(&pool.startup_timeout)
                    .context("pool.startup_timeout")?,
                liveness_timeout,
                heartbeat_interval,
                max_restarts: pool.max_restarts,
                restart_backoff: Self::parse_duration(&pool.restart_backoff)
                    .context("pool.restart_backoff")?,
                worker_binary,
                processor: self.worker.processor.clone(),
                args: self.worker.args.clone(),
                pin_cpus: pool.pin_cpus,
            },
            policy: pool.policy,
            max_in_flight: pool.max_in_flight,
            max_attempts: pool.max_attempts,
            reorder: ReorderConfig {
                mode: self.collector.mode,
                window: self.collector.reorder_window,
                timeout: Self::parse_duration(&self.collector.reorder_timeout)
                    .context("collector.reorder_timeout")?,
            },
            poll_interval: Self::parse_duration(&self.runtime.poll_interval)
                .context("runtime.poll_interval")?,
            drain_timeout: Self::parse_duration(&self.runtime.drain_timeout)
                .context("runtime.drain_timeout")?,
        })
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# evtflow configuration

[rings]
# Input ring the supervisor pulls events from
input = "evtflow.input"
# Output ring results are emitted on
output = "evtflow.output"
# Per-worker rings are named {worker_prefix}.{worker}.in / .out
worker_prefix = "evtflow"
# Capacity in bytes of every ring the supervisor creates
capacity = 4194304

[pool]
# Number of worker processes (uncomment to override the CPU count)
# workers = 4
# Abort the run if fewer workers than this become ready
min_workers = 1
# Dispatch policy: "round-robin" or "least-loaded"
policy = "round-robin"
# Time a new worker has to report ready
startup_timeout = "10s"
# A worker silent for this long, or holding an event this long, is dead
liveness_timeout = "30s"
# Heartbeat interval requested from workers
heartbeat_interval = "500ms"
# Restarts allowed per worker slot
max_restarts = 5
# Delay before a dead worker is respawned
restart_backoff = "200ms"
# Dispatches of one event before it is abandoned
max_attempts = 3
# Events in flight per worker (0 = limited by ring space only)
max_in_flight = 64
# Worker executable (uncomment to use something other than this binary)
# worker_binary = "/usr/local/bin/evtflow"
# Pin each worker to its own CPU
pin_cpus = false

[collector]
# Ordering mode: "strict" or "best-effort"
mode = "strict"
# Results that may wait behind a missing head of line without time limit
reorder_window = 1024
# Past the window, how long the missing head may block output before it is gapped
reorder_timeout = "30s"

[runtime]
# Sleep between idle loop iterations
poll_interval = "1ms"
# Give up on in-flight work this long after the last completion once draining
drain_timeout = "60s"

[worker]
# Processor run by every worker: passthrough, reverse, chaos or a registered one
processor = "passthrough"
args = []
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty duration string");
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            bail!("Invalid duration number: {}", num_part);
        }

        let multiplier: f64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" | "" => 1_000_000_000.0,
            "m" | "min" => 60_000_000_000.0,
            _ => bail!("Unknown duration unit: {}", unit_part),
        };

        Ok(Duration::from_nanos((value * multiplier) as u64))
    }
}
