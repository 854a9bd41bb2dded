#![warn(missing_docs)]
//! evtflow logic
//!
//! Process-free bookkeeping used by the supervisor:
//! - [`InFlightList`]: dispatched events awaiting a result, in dispatch order
//! - [`Reorderer`]: turns out-of-order completions into an ordered stream with gap markers
//! - [`RunSummary`]: the counters reported at the end of a run
//!
//! Nothing here touches shared memory or processes, so every rule is unit-testable
//! with explicit timestamps.

mod inflight;
mod reorder;
mod summary;

pub use inflight::{InFlightEntry, InFlightList, NotFoundWarning};
pub use reorder::{Acceptance, Emission, OrderingMode, ReorderConfig, ReorderStats, Reorderer};
pub use summary::{RunSummary, WorkerSummary};

use serde::{Deserialize, Serialize};

/// Identifier of a worker slot. Stable across restarts of the slot's process.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        WorkerId(id)
    }
}
