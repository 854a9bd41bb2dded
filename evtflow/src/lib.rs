#![warn(missing_docs)]
//! # evtflow
//!
//! Multi-process event distribution over shared-memory ring buffers.
//!
//! A single supervisor pulls opaque event records from an input ring, spreads
//! them over a pool of worker processes, and writes the results to an output
//! ring:
//! - **Shared-memory rings**: fixed-capacity FIFO byte queues any process can
//!   attach to by name; writers block when full, readers when empty
//! - **Crash isolation**: a worker that dies, hangs or goes silent is restarted
//!   and its in-flight events are replayed on the survivors
//! - **Ordering**: results leave in dispatch order (`strict`) with explicit gap
//!   markers for lost events, or in arrival order (`best-effort`)
//! - **Pluggable processors**: per-event computations registered with
//!   `inventory` and selected by name
//!
//! ## Quick Start
//!
//! ```ignore
//! use evtflow::prelude::*;
//!
//! struct Calibrate;
//!
//! impl EventProcessor for Calibrate {
//!     fn process(&mut self, record: &EventRecord) -> Result<Vec<u8>, ProcessError> {
//!         Ok(calibrate(&record.payload))
//!     }
//! }
//!
//! evtflow::internal::inventory::submit! {
//!     ProcessorDef {
//!         name: "calibrate",
//!         description: "apply detector calibration",
//!         factory: |_args| Ok(Box::new(Calibrate)),
//!     }
//! }
//!
//! fn main() {
//!     evtflow::run().unwrap();
//! }
//! ```
//!
//! The binary is both supervisor and worker: `my-binary run --processor calibrate`
//! spawns copies of itself in worker mode.

// Re-export IPC types
pub use evtflow_ipc::{
    DEFAULT_RING_CAPACITY, EventRecord, RECORD_HEADER_LEN, RecordError, RecordFlags,
    RecordHeader, RingBuffer, RingError, RingStats,
};

// Re-export worker runtime
pub use evtflow_core::{
    ChaosProcessor, EventProcessor, Passthrough, ProcessError, ProcessorDef, Reverse,
    registered_processors,
};

// Re-export bookkeeping types
pub use evtflow_logic::{
    Acceptance, Emission, InFlightEntry, InFlightList, NotFoundWarning, OrderingMode,
    ReorderConfig, Reorderer, RunSummary, WorkerId, WorkerSummary,
};

// Re-export the supervisor side
pub use evtflow_cli::{
    Collector, DispatchPolicy, DispatchTarget, Distributor, EvtflowConfig, PendingRecord,
    Pipeline, PipelineSettings, SupervisorError,
};

/// Internal re-exports for processor registration
#[doc(hidden)]
pub mod internal {
    pub use inventory;
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        EventProcessor, EventRecord, OrderingMode, ProcessError, ProcessorDef, RingBuffer,
        RunSummary,
    };
}

/// Run the evtflow CLI.
///
/// Call this from the binary's `main()` so it can act as supervisor and worker:
/// ```ignore
/// fn main() {
///     evtflow::run().unwrap();
/// }
/// ```
pub use evtflow_cli::run;
