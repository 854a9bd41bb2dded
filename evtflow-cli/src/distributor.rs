//! Event distribution across worker input rings

use crate::supervisor::WorkerSlot;
use evtflow_ipc::{RingBuffer, RingError};
use evtflow_logic::{InFlightList, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

/// How the next worker is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// Rotate through live workers
    #[default]
    RoundRobin,
    /// Fewest events in flight first, ties broken by worker id
    LeastLoaded,
}

impl FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(DispatchPolicy::RoundRobin),
            "least-loaded" => Ok(DispatchPolicy::LeastLoaded),
            other => Err(format!(
                "unknown dispatch policy '{}' (expected round-robin or least-loaded)",
                other
            )),
        }
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPolicy::RoundRobin => write!(f, "round-robin"),
            DispatchPolicy::LeastLoaded => write!(f, "least-loaded"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no live worker")]
    NoWorkerAvailable,

    #[error("every live worker is saturated")]
    Saturated,

    /// The record can never fit a worker ring; no worker is at fault
    #[error("record {sequence} of {len} bytes does not fit in a worker ring of {capacity} bytes")]
    RecordTooLarge {
        sequence: u64,
        len: usize,
        capacity: usize,
    },

    #[error("{worker} input ring failed: {source}")]
    Ring {
        worker: WorkerId,
        #[source]
        source: RingError,
    },
}

/// An encoded record waiting for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub sequence: u64,
    /// Encoded [`evtflow_ipc::EventRecord`]
    pub bytes: Vec<u8>,
    /// Dispatches so far
    pub attempts: u32,
    /// Worker that last held this record and died
    pub avoid: Option<WorkerId>,
}

impl PendingRecord {
    pub fn new(sequence: u64, bytes: Vec<u8>) -> Self {
        Self {
            sequence,
            bytes,
            attempts: 0,
            avoid: None,
        }
    }
}

/// A dispatch that did not happen; the record is handed back
#[derive(Debug)]
pub struct DispatchFailure {
    pub record: PendingRecord,
    pub error: DispatchError,
}

/// Something the distributor can push events into
pub trait DispatchTarget {
    fn worker_id(&self) -> WorkerId;

    /// Whether the target takes events at all right now
    fn accepts_work(&self) -> bool;

    fn input_ring(&self) -> &RingBuffer;
}

impl DispatchTarget for WorkerSlot {
    fn worker_id(&self) -> WorkerId {
        self.id()
    }

    fn accepts_work(&self) -> bool {
        self.state().is_live()
    }

    fn input_ring(&self) -> &RingBuffer {
        self.input()
    }
}

/// Chooses workers and records dispatches in the in-flight list
#[derive(Debug)]
pub struct Distributor {
    policy: DispatchPolicy,
    max_in_flight: usize,
    cursor: usize,
}

impl Distributor {
    /// `max_in_flight` of 0 leaves the per-worker load bounded by ring space only
    pub fn new(policy: DispatchPolicy, max_in_flight: usize) -> Self {
        Self {
            policy,
            max_in_flight,
            cursor: 0,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Copy `record` into one live worker's input ring.
    ///
    /// Only non-blocking pushes are used; a full ring moves on to the next
    /// candidate. On success the record moves into `inflight` with its
    /// attempt count bumped.
    pub fn dispatch<T: DispatchTarget>(
        &mut self,
        record: PendingRecord,
        targets: &[T],
        inflight: &mut InFlightList,
        now: Instant,
    ) -> Result<WorkerId, DispatchFailure> {
        let order = self.candidates(targets, inflight, record.avoid);
        if order.is_empty() {
            let error = if targets.iter().any(|t| t.accepts_work()) {
                DispatchError::Saturated
            } else {
                DispatchError::NoWorkerAvailable
            };
            return Err(DispatchFailure { record, error });
        }

        for index in order {
            let target = &targets[index];
            match target.input_ring().push_non_blocking(&record.bytes) {
                Ok(true) => {
                    let worker = target.worker_id();
                    if self.policy == DispatchPolicy::RoundRobin {
                        self.cursor = (index + 1) % targets.len();
                    }
                    tracing::trace!(sequence = record.sequence, %worker, "dispatched");
                    inflight.store_event_at(
                        record.sequence,
                        worker,
                        record.bytes,
                        record.attempts + 1,
                        now,
                    );
                    return Ok(worker);
                }
                Ok(false) => continue,
                Err(RingError::RecordTooLarge { len, capacity }) => {
                    let sequence = record.sequence;
                    return Err(DispatchFailure {
                        record,
                        error: DispatchError::RecordTooLarge {
                            sequence,
                            len,
                            capacity,
                        },
                    });
                }
                Err(source) => {
                    return Err(DispatchFailure {
                        record,
                        error: DispatchError::Ring {
                            worker: target.worker_id(),
                            source,
                        },
                    });
                }
            }
        }

        Err(DispatchFailure {
            record,
            error: DispatchError::Saturated,
        })
    }

    /// Indices of targets to try, best first. The avoided worker goes last.
    fn candidates<T: DispatchTarget>(
        &self,
        targets: &[T],
        inflight: &InFlightList,
        avoid: Option<WorkerId>,
    ) -> Vec<usize> {
        let len = targets.len();
        let mut order: Vec<usize> = match self.policy {
            DispatchPolicy::RoundRobin => (0..len).map(|i| (self.cursor + i) % len).collect(),
            DispatchPolicy::LeastLoaded => {
                let mut indices: Vec<usize> = (0..len).collect();
                indices.sort_by_key(|&i| {
                    let id = targets[i].worker_id();
                    (inflight.count_for(id), id)
                });
                indices
            }
        };
        order.retain(|&i| {
            let target = &targets[i];
            target.accepts_work()
                && (self.max_in_flight == 0
                    || inflight.count_for(target.worker_id()) < self.max_in_flight)
        });
        if let Some(avoid) = avoid {
            // Stable partition: everyone else keeps their order
            order.sort_by_key(|&i| targets[i].worker_id() == avoid);
        }
        order
    }
}
