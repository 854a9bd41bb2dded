#![warn(missing_docs)]
//! evtflow core - worker runtime
//!
//! This crate runs inside every worker process:
//! - [`EventProcessor`], the user-supplied per-event computation
//! - A processor registry fed by `inventory::submit!` plus the built-in processors
//! - [`WorkerMain`], the pop → process → push loop with heartbeats and graceful shutdown
//! - CPU affinity pinning for workers that ask for it

mod affinity;
mod builtin;
mod processor;
mod worker;

pub use affinity::{available_cpus, pin_to_cpu};
pub use builtin::{ChaosProcessor, Passthrough, Reverse};
pub use processor::{
    EventProcessor, ProcessError, ProcessorDef, find_processor, instantiate, registered_processors,
};
pub use worker::{
    ControlChannel, WorkerError, WorkerMain, WorkerOptions, request_shutdown, run_worker,
    shutdown_requested,
};

/// Re-exported so downstream crates can register processors without a direct dependency
pub use inventory;

inventory::collect!(ProcessorDef);

/// Anchor to prevent LTO from stripping inventory entries
#[used]
#[doc(hidden)]
pub static REGISTRY_ANCHOR: fn() = || {
    for _ in inventory::iter::<ProcessorDef> {}
};
