//! In-flight tracking list
//!
//! Every dispatched event stays here until its result is collected. Entries
//! are appended at dispatch time, so the front of the list is always the
//! oldest outstanding event and timeout detection only has to look there.

use crate::WorkerId;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// An event that has been handed to a worker but not yet completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    /// Global sequence number
    pub sequence: u64,
    /// Worker currently holding the event
    pub worker: WorkerId,
    /// When the event was (re)dispatched
    pub dispatched_at: Instant,
    /// Number of dispatches so far, including this one
    pub attempts: u32,
    /// Encoded record, kept for replay
    pub record: Vec<u8>,
}

/// A completion or removal referred to a sequence that is not in flight.
///
/// Expected after a redispatch race; callers log it and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence {sequence} is not in flight")]
pub struct NotFoundWarning {
    /// Sequence that was looked up
    pub sequence: u64,
}

/// Dispatch-ordered list of outstanding events
#[derive(Debug, Default)]
pub struct InFlightList {
    entries: VecDeque<InFlightEntry>,
}

impl InFlightList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a first dispatch of `sequence` to `worker`.
    pub fn store_event(&mut self, sequence: u64, worker: WorkerId, record: Vec<u8>) {
        self.store_event_at(sequence, worker, record, 1, Instant::now());
    }

    /// Record a dispatch with an explicit attempt count and timestamp.
    ///
    /// Timestamps must be non-decreasing across calls to keep the front of
    /// the list the oldest entry.
    pub fn store_event_at(
        &mut self,
        sequence: u64,
        worker: WorkerId,
        record: Vec<u8>,
        attempts: u32,
        now: Instant,
    ) {
        debug_assert!(
            self.entries.back().is_none_or(|e| e.dispatched_at <= now),
            "in-flight timestamps must be monotonic"
        );
        self.entries.push_back(InFlightEntry {
            sequence,
            worker,
            dispatched_at: now,
            attempts,
            record,
        });
    }

    /// Remove the entry for `sequence`, whichever worker holds it.
    pub fn remove_event(&mut self, sequence: u64) -> Result<InFlightEntry, NotFoundWarning> {
        let index = self
            .entries
            .iter()
            .position(|e| e.sequence == sequence)
            .ok_or(NotFoundWarning { sequence })?;
        self.entries
            .remove(index)
            .ok_or(NotFoundWarning { sequence })
    }

    /// Worker holding the oldest entry, if that entry has waited longer than `timeout`.
    pub fn check_for_timeout(&self, timeout: Duration) -> Option<WorkerId> {
        self.check_for_timeout_at(timeout, Instant::now())
    }

    /// [`InFlightList::check_for_timeout`] against an explicit clock
    pub fn check_for_timeout_at(&self, timeout: Duration, now: Instant) -> Option<WorkerId> {
        let oldest = self.entries.front()?;
        (now.saturating_duration_since(oldest.dispatched_at) > timeout).then_some(oldest.worker)
    }

    /// Remove and return every entry held by `worker`, oldest first.
    pub fn take_worker(&mut self, worker: WorkerId) -> Vec<InFlightEntry> {
        let mut taken = Vec::new();
        self.entries.retain(|entry| {
            if entry.worker == worker {
                taken.push(entry.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Entries currently held by `worker`
    pub fn count_for(&self, worker: WorkerId) -> usize {
        self.entries.iter().filter(|e| e.worker == worker).count()
    }

    /// Oldest outstanding entry
    pub fn oldest(&self) -> Option<&InFlightEntry> {
        self.entries.front()
    }

    /// Whether `sequence` is in flight
    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.iter().any(|e| e.sequence == sequence)
    }

    /// Iterate entries in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &InFlightEntry> {
        self.entries.iter()
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
