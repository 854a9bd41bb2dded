//! Run summary reported when the supervisor finishes

use crate::WorkerId;
use serde::{Deserialize, Serialize};

/// Per-slot counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Slot id
    pub id: WorkerId,
    /// Records processed successfully, as last reported by the worker
    pub processed: u64,
    /// Records that came back with the error flag
    pub failed: u64,
    /// Records dispatched to this slot
    pub dispatched: u64,
    /// Times the slot's process was restarted
    pub restarts: u32,
    /// Deaths caused by an in-flight or heartbeat timeout
    pub timeouts: u32,
    /// Description of the most recent death, if any
    pub last_death: Option<String>,
}

impl WorkerSummary {
    /// Empty counters for `id`
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Outcome of one supervisor run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Output ordering used
    pub mode: String,
    /// Records read from the input ring
    pub input_records: u64,
    /// Input records refused: malformed, out of order, or too large for a worker ring
    pub rejected: u64,
    /// First dispatches
    pub dispatched: u64,
    /// Dispatches of reclaimed events after a worker died
    pub redispatched: u64,
    /// Results forwarded to the output ring
    pub completed: u64,
    /// Forwarded results carrying the error flag
    pub failed_events: u64,
    /// Results discarded because the sequence had already completed
    pub duplicates: u64,
    /// Results discarded because the sequence had already been gapped
    pub stale: u64,
    /// Events given up on after too many failed attempts
    pub abandoned: Vec<u64>,
    /// Sequences replaced by a gap marker on output
    pub gapped: Vec<u64>,
    /// Whether an end-of-run record was seen and forwarded
    pub end_of_run: bool,
    /// Whether the run was cut short by a signal
    pub interrupted: bool,
    /// Wall-clock duration of the run in seconds
    pub elapsed_secs: f64,
    /// Per-slot counters, ordered by id
    pub workers: Vec<WorkerSummary>,
}

impl RunSummary {
    /// Total worker restarts across all slots
    pub fn total_restarts(&self) -> u32 {
        self.workers.iter().map(|w| w.restarts).sum()
    }

    /// Whether every input event reached the output as a result
    pub fn is_lossless(&self) -> bool {
        self.abandoned.is_empty() && self.gapped.is_empty()
    }

    /// Results per second over the run
    pub fn throughput(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.completed as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}
