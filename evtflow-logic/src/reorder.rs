//! Result reordering
//!
//! Workers finish events in whatever order they like. The [`Reorderer`]
//! restores dispatch order (strict mode) or forwards results as they arrive
//! (best-effort mode). Either way an event that will never complete shows up
//! as an [`Emission::Gap`] so consumers see every sequence exactly once.
//!
//! In strict mode the head-of-line sequence is given up on when
//! - more than `window` later results are buffered behind it and it has
//!   held back output for longer than `timeout`, or
//! - it was explicitly abandoned.
//!
//! A head with room left in the window waits until it completes, is
//! abandoned, or the run finishes.

use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

/// How results are ordered on output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingMode {
    /// Emit in dispatch order, with gap markers for lost events
    #[default]
    Strict,
    /// Emit in arrival order
    BestEffort,
}

impl std::str::FromStr for OrderingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(OrderingMode::Strict),
            "best-effort" | "besteffort" | "best_effort" => Ok(OrderingMode::BestEffort),
            other => Err(format!(
                "unknown ordering mode '{}' (expected strict or best-effort)",
                other
            )),
        }
    }
}

impl std::fmt::Display for OrderingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderingMode::Strict => f.write_str("strict"),
            OrderingMode::BestEffort => f.write_str("best-effort"),
        }
    }
}

/// Reorderer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderConfig {
    /// Output ordering
    pub mode: OrderingMode,
    /// Results that may wait behind a missing head without time limit
    pub window: usize,
    /// How long a missing head may hold back an overflowing window
    pub timeout: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            mode: OrderingMode::Strict,
            window: 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Something the reorderer releases downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission<T> {
    /// A completed result
    Item(u64, T),
    /// The sequence will never be delivered
    Gap(u64),
}

impl<T> Emission<T> {
    /// Sequence number of the emission
    pub fn sequence(&self) -> u64 {
        match self {
            Emission::Item(seq, _) | Emission::Gap(seq) => *seq,
        }
    }

    /// Whether this is a gap marker
    pub fn is_gap(&self) -> bool {
        matches!(self, Emission::Gap(_))
    }
}

/// What happened to a result handed to [`Reorderer::accept`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Buffered or emitted
    Accepted,
    /// The sequence already completed, or was never expected
    Duplicate,
    /// The sequence was already replaced by a gap
    Stale,
}

/// Reorderer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderStats {
    /// Results emitted
    pub emitted: u64,
    /// Gap markers emitted
    pub gaps: u64,
    /// Results discarded as duplicates
    pub duplicates: u64,
    /// Results that arrived after their gap
    pub stale: u64,
    /// Most results ever buffered at once
    pub max_buffered: usize,
}

/// A buffered result ordered by sequence only
struct Held<T> {
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Held<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl<T> Eq for Held<T> {}

impl<T> PartialOrd for Held<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Held<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

/// Restores dispatch order over out-of-order completions
pub struct Reorderer<T> {
    config: ReorderConfig,
    /// Sequences in dispatch order that have not been emitted yet (strict mode)
    expected: VecDeque<u64>,
    /// Expected sequences whose result has not arrived
    outstanding: FxHashSet<u64>,
    /// Arrived results waiting for their turn, min-heap by sequence
    held: BinaryHeap<Reverse<Held<T>>>,
    /// Outstanding sequences given up on but not yet reached by the head
    abandoned: FxHashSet<u64>,
    /// Sequences gapped on timeout whose result may still turn up
    gapped: FxHashSet<u64>,
    last_expected: Option<u64>,
    head_blocked_since: Option<Instant>,
    ready: Vec<Emission<T>>,
    stats: ReorderStats,
}

impl<T> Reorderer<T> {
    /// Create a reorderer
    pub fn new(config: ReorderConfig) -> Self {
        Self {
            config,
            expected: VecDeque::new(),
            outstanding: FxHashSet::default(),
            held: BinaryHeap::new(),
            abandoned: FxHashSet::default(),
            gapped: FxHashSet::default(),
            last_expected: None,
            head_blocked_since: None,
            ready: Vec::new(),
            stats: ReorderStats::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ReorderConfig {
        &self.config
    }

    /// Register a dispatched sequence. Sequences must be registered in
    /// strictly increasing order; anything else is refused.
    pub fn expect(&mut self, sequence: u64) -> bool {
        if self.last_expected.is_some_and(|last| sequence <= last) {
            return false;
        }
        self.last_expected = Some(sequence);
        self.outstanding.insert(sequence);
        if self.config.mode == OrderingMode::Strict {
            self.expected.push_back(sequence);
        }
        true
    }

    /// Hand over a completed result.
    pub fn accept(&mut self, sequence: u64, item: T, now: Instant) -> Acceptance {
        if !self.outstanding.remove(&sequence) {
            if self.gapped.remove(&sequence) {
                self.stats.stale += 1;
                return Acceptance::Stale;
            }
            self.stats.duplicates += 1;
            return Acceptance::Duplicate;
        }

        match self.config.mode {
            OrderingMode::BestEffort => self.emit(Emission::Item(sequence, item)),
            OrderingMode::Strict => {
                self.held.push(Reverse(Held { sequence, item }));
                self.stats.max_buffered = self.stats.max_buffered.max(self.held.len());
                self.release(now);
            }
        }
        Acceptance::Accepted
    }

    /// Give up on a sequence; it will be emitted as a gap in its turn.
    /// Returns `false` if the sequence was not outstanding.
    pub fn abandon(&mut self, sequence: u64, now: Instant) -> bool {
        if !self.outstanding.remove(&sequence) {
            // Already gapped on timeout; no result will come for it now
            self.gapped.remove(&sequence);
            return false;
        }
        match self.config.mode {
            OrderingMode::BestEffort => self.emit_gap(sequence),
            OrderingMode::Strict => {
                self.abandoned.insert(sequence);
                self.release(now);
            }
        }
        true
    }

    /// Apply the window and timeout rules and take everything ready for output.
    pub fn poll(&mut self, now: Instant) -> Vec<Emission<T>> {
        if self.config.mode == OrderingMode::Strict {
            self.release(now);
            while let Some(&head) = self.expected.front() {
                if !self.head_must_give_way(now) {
                    break;
                }
                tracing::debug!(
                    sequence = head,
                    buffered = self.held.len(),
                    "gapping head-of-line sequence"
                );
                self.expected.pop_front();
                self.outstanding.remove(&head);
                self.abandoned.remove(&head);
                self.gapped.insert(head);
                self.emit_gap(head);
                self.head_blocked_since = None;
                self.release(now);
            }
        }
        std::mem::take(&mut self.ready)
    }

    /// Flush everything at end of run; missing sequences become gaps.
    pub fn finish(&mut self) -> Vec<Emission<T>> {
        match self.config.mode {
            OrderingMode::Strict => {
                while let Some(head) = self.expected.pop_front() {
                    if self.held.peek().is_some_and(|Reverse(h)| h.sequence == head) {
                        if let Some(Reverse(held)) = self.held.pop() {
                            self.emit(Emission::Item(held.sequence, held.item));
                        }
                    } else {
                        self.outstanding.remove(&head);
                        self.abandoned.remove(&head);
                        self.emit_gap(head);
                    }
                }
            }
            OrderingMode::BestEffort => {
                let mut missing: Vec<u64> = self.outstanding.drain().collect();
                missing.sort_unstable();
                for sequence in missing {
                    self.emit_gap(sequence);
                }
            }
        }
        self.gapped.clear();
        self.head_blocked_since = None;
        std::mem::take(&mut self.ready)
    }

    /// Finish the current run like [`Reorderer::finish`], then accept
    /// sequence numbers starting anywhere for the next one.
    pub fn close_run(&mut self) -> Vec<Emission<T>> {
        let emissions = self.finish();
        self.last_expected = None;
        emissions
    }

    /// Sequences expected but not yet completed
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Results waiting behind a missing head
    pub fn buffered(&self) -> usize {
        self.held.len()
    }

    /// Whether every expected sequence has been emitted
    pub fn is_drained(&self) -> bool {
        self.outstanding.is_empty() && self.held.is_empty() && self.expected.is_empty()
    }

    /// Counters so far
    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Emit the longest run of consecutive ready heads (strict mode).
    fn release(&mut self, now: Instant) {
        while let Some(&head) = self.expected.front() {
            if self.held.peek().is_some_and(|Reverse(h)| h.sequence == head) {
                if let Some(Reverse(held)) = self.held.pop() {
                    self.expected.pop_front();
                    self.emit(Emission::Item(held.sequence, held.item));
                }
            } else if self.abandoned.remove(&head) {
                self.expected.pop_front();
                self.emit_gap(head);
            } else {
                break;
            }
            self.head_blocked_since = None;
        }

        if self.held.is_empty() {
            self.head_blocked_since = None;
        } else {
            self.head_blocked_since.get_or_insert(now);
        }
    }

    fn head_must_give_way(&self, now: Instant) -> bool {
        if self.held.is_empty() || self.held.len() <= self.config.window {
            return false;
        }
        self.head_blocked_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.config.timeout)
    }

    fn emit(&mut self, emission: Emission<T>) {
        self.stats.emitted += 1;
        self.ready.push(emission);
    }

    fn emit_gap(&mut self, sequence: u64) {
        self.stats.gaps += 1;
        self.ready.push(Emission::Gap(sequence));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict(window: usize, timeout_ms: u64) -> Reorderer<&'static str> {
        Reorderer::new(ReorderConfig {
            mode: OrderingMode::Strict,
            window,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    fn sequences<T>(emissions: &[Emission<T>]) -> Vec<u64> {
        emissions.iter().map(Emission::sequence).collect()
    }

    #[test]
    fn test_strict_restores_order() {
        let now = Instant::now();
        let mut r = strict(16, 1_000);
        for seq in 1..=5 {
            assert!(r.expect(seq));
        }

        let mut out = Vec::new();
        for seq in [3, 1, 2, 5, 4] {
            assert_eq!(r.accept(seq, "ok", now), Acceptance::Accepted);
            out.extend(r.poll(now));
        }
        assert_eq!(sequences(&out), vec![1, 2, 3, 4, 5]);
        assert!(out.iter().all(|e| !e.is_gap()));
        assert!(r.is_drained());
    }

    #[test]
    fn test_abandoned_event_becomes_gap_in_place() {
        let now = Instant::now();
        let mut r = strict(16, 1_000);
        for seq in 1..=3 {
            r.expect(seq);
        }
        r.accept(1, "a", now);
        r.accept(3, "c", now);
        assert!(r.abandon(2, now));

        let out = r.poll(now);
        assert_eq!(
            out,
            vec![
                Emission::Item(1, "a"),
                Emission::Gap(2),
                Emission::Item(3, "c")
            ]
        );
        assert_eq!(r.stats().gaps, 1);
    }

    #[test]
    fn test_slow_head_keeps_its_place_in_overflowing_window() {
        let start = Instant::now();
        let mut r = strict(2, 60_000);
        for seq in 1..=5 {
            r.expect(seq);
        }
        for (seq, item) in [(2, "b"), (3, "c"), (4, "d")] {
            r.accept(seq, item, start);
        }
        // Window overflowed, but the head is still within its timeout
        assert!(r.poll(start + Duration::from_secs(1)).is_empty());

        let later = start + Duration::from_secs(2);
        assert_eq!(r.accept(1, "a", later), Acceptance::Accepted);
        let out = r.poll(later);
        assert_eq!(sequences(&out), vec![1, 2, 3, 4]);
        assert!(out.iter().all(|e| !e.is_gap()));
        assert_eq!(r.stats().stale, 0);
    }

    #[test]
    fn test_overflowing_window_gaps_head_after_timeout() {
        let start = Instant::now();
        let mut r = strict(1, 50);
        for seq in 1..=3 {
            r.expect(seq);
        }
        r.accept(2, "b", start);
        r.accept(3, "c", start);
        assert!(r.poll(start + Duration::from_millis(40)).is_empty());

        let out = r.poll(start + Duration::from_millis(60));
        assert_eq!(
            out,
            vec![Emission::Gap(1), Emission::Item(2, "b"), Emission::Item(3, "c")]
        );

        // The late result for the gapped sequence is dropped
        assert_eq!(r.accept(1, "late", start), Acceptance::Stale);
        assert_eq!(r.stats().stale, 1);
        assert!(r.gapped.is_empty());
    }

    #[test]
    fn test_head_within_window_is_never_gapped() {
        let start = Instant::now();
        let mut r = strict(100, 50);
        r.expect(10);
        r.expect(20);
        r.accept(20, "later", start);
        assert!(r.poll(start + Duration::from_secs(60)).is_empty());

        r.accept(10, "slow", start + Duration::from_secs(60));
        let out = r.poll(start + Duration::from_secs(60));
        assert_eq!(out, vec![Emission::Item(10, "slow"), Emission::Item(20, "later")]);
    }

    #[test]
    fn test_gapped_sequences_forgotten_once_settled() {
        let start = Instant::now();
        let mut r = strict(0, 10);
        for seq in 1..=4 {
            r.expect(seq);
        }
        r.accept(2, "b", start);
        let out = r.poll(start + Duration::from_millis(20));
        assert_eq!(sequences(&out), vec![1, 2]);
        assert!(r.gapped.contains(&1));

        // The gapped event is later given up on for good
        assert!(!r.abandon(1, start));
        assert!(r.gapped.is_empty());

        // Abandoned events never wait for a late result
        assert!(r.abandon(3, start));
        r.accept(4, "d", start);
        assert_eq!(sequences(&r.poll(start)), vec![3, 4]);
        assert!(r.gapped.is_empty());
        assert_eq!(r.accept(3, "late", start), Acceptance::Duplicate);
    }

    #[test]
    fn test_close_run_restarts_numbering() {
        let now = Instant::now();
        let mut r = strict(16, 1_000);
        r.expect(1);
        r.expect(2);
        r.accept(2, "b", now);

        assert_eq!(r.close_run(), vec![Emission::Gap(1), Emission::Item(2, "b")]);
        assert!(r.is_drained());
        assert!(r.expect(1));
        r.accept(1, "next run", now);
        assert_eq!(r.poll(now), vec![Emission::Item(1, "next run")]);
    }

    #[test]
    fn test_missing_head_without_buffered_results_waits() {
        let start = Instant::now();
        let mut r = strict(0, 10);
        r.expect(1);
        // Nothing held back, so nothing to gap no matter how long it takes
        assert!(r.poll(start + Duration::from_secs(5)).is_empty());
        r.accept(1, "slow", start + Duration::from_secs(5));
        assert_eq!(sequences(&r.poll(start)), vec![1]);
    }

    #[test]
    fn test_duplicates_discarded() {
        let now = Instant::now();
        let mut r = strict(16, 1_000);
        r.expect(1);
        assert_eq!(r.accept(1, "first", now), Acceptance::Accepted);
        assert_eq!(r.accept(1, "second", now), Acceptance::Duplicate);
        assert_eq!(r.accept(99, "never expected", now), Acceptance::Duplicate);
        assert_eq!(r.poll(now), vec![Emission::Item(1, "first")]);
        assert_eq!(r.stats().duplicates, 2);
    }

    #[test]
    fn test_non_increasing_expect_refused() {
        let mut r = strict(16, 1_000);
        assert!(r.expect(5));
        assert!(!r.expect(5));
        assert!(!r.expect(3));
        assert!(r.expect(9));
        assert_eq!(r.outstanding(), 2);
    }

    #[test]
    fn test_non_contiguous_sequences() {
        let now = Instant::now();
        let mut r = strict(16, 1_000);
        for seq in [100, 205, 310] {
            r.expect(seq);
        }
        r.accept(310, "c", now);
        r.accept(100, "a", now);
        assert_eq!(sequences(&r.poll(now)), vec![100]);
        r.accept(205, "b", now);
        assert_eq!(sequences(&r.poll(now)), vec![205, 310]);
    }

    #[test]
    fn test_finish_fills_gaps() {
        let now = Instant::now();
        let mut r = strict(16, 1_000);
        for seq in 1..=4 {
            r.expect(seq);
        }
        r.accept(2, "b", now);
        r.accept(4, "d", now);
        assert!(r.poll(now).is_empty());

        let out = r.finish();
        assert_eq!(
            out,
            vec![
                Emission::Gap(1),
                Emission::Item(2, "b"),
                Emission::Gap(3),
                Emission::Item(4, "d")
            ]
        );
        assert!(r.is_drained());
    }

    #[test]
    fn test_best_effort_forwards_immediately() {
        let now = Instant::now();
        let mut r: Reorderer<&str> = Reorderer::new(ReorderConfig {
            mode: OrderingMode::BestEffort,
            ..Default::default()
        });
        for seq in 1..=4 {
            r.expect(seq);
        }
        r.accept(3, "c", now);
        r.accept(1, "a", now);
        assert!(r.abandon(2, now));
        assert_eq!(
            r.poll(now),
            vec![Emission::Item(3, "c"), Emission::Item(1, "a"), Emission::Gap(2)]
        );
        assert_eq!(r.finish(), vec![Emission::Gap(4)]);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("strict".parse::<OrderingMode>().unwrap(), OrderingMode::Strict);
        assert_eq!(
            "best-effort".parse::<OrderingMode>().unwrap(),
            OrderingMode::BestEffort
        );
        assert!("random".parse::<OrderingMode>().is_err());
        assert_eq!(OrderingMode::BestEffort.to_string(), "best-effort");
    }
}
