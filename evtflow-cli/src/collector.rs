//! Collector: matches worker results against the in-flight list, restores
//! order and writes the output ring.

use evtflow_ipc::{EventRecord, RingBuffer, RingError};
use evtflow_logic::{
    Acceptance, Emission, InFlightList, ReorderConfig, Reorderer, RunSummary, WorkerId,
};
use fxhash::FxHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Encoded records queued for the output ring before it pushes back
const DEFAULT_BACKLOG_LIMIT: usize = 1024;

/// Identifiers a gap marker needs, kept until the sequence is emitted
#[derive(Debug, Clone, Copy)]
struct Origin {
    experiment: u32,
    run: u32,
}

pub struct Collector {
    reorderer: Reorderer<EventRecord>,
    output: RingBuffer,
    origins: FxHashMap<u64, Origin>,
    backlog: VecDeque<Vec<u8>>,
    backlog_limit: usize,
    completed: u64,
    failed: u64,
    unmatched: u64,
    gapped: Vec<u64>,
    written: u64,
}

impl Collector {
    pub fn new(config: ReorderConfig, output: RingBuffer) -> Self {
        Self {
            reorderer: Reorderer::new(config),
            output,
            origins: FxHashMap::default(),
            backlog: VecDeque::new(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            completed: 0,
            failed: 0,
            unmatched: 0,
            gapped: Vec::new(),
            written: 0,
        }
    }

    /// Override how many records may queue up in memory before
    /// [`Collector::is_backpressured`] reports true
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }

    pub fn output(&self) -> &RingBuffer {
        &self.output
    }

    /// Register a sequence accepted from the input, in input order.
    pub fn expect(&mut self, sequence: u64, experiment: u32, run: u32) -> bool {
        if !self.reorderer.expect(sequence) {
            return false;
        }
        self.origins.insert(sequence, Origin { experiment, run });
        true
    }

    /// Take a result a worker pushed.
    ///
    /// The first completion of a sequence wins regardless of which worker
    /// produced it; later completions find no in-flight entry and are
    /// discarded.
    pub fn on_worker_result(
        &mut self,
        record: EventRecord,
        worker: WorkerId,
        inflight: &mut InFlightList,
        now: Instant,
    ) -> Acceptance {
        let sequence = record.sequence;
        match inflight.remove_event(sequence) {
            Ok(entry) if entry.worker != worker => {
                debug!(sequence, holder = %entry.worker, %worker, "result from a previous holder");
            }
            Ok(_) => {}
            Err(warning) => {
                warn!(%worker, "discarding result: {}", warning);
                self.unmatched += 1;
                return Acceptance::Duplicate;
            }
        }

        let is_error = record.is_error();
        let acceptance = self.reorderer.accept(sequence, record, now);
        match acceptance {
            Acceptance::Accepted => {
                self.completed += 1;
                if is_error {
                    self.failed += 1;
                }
            }
            Acceptance::Stale => {
                debug!(sequence, %worker, "result arrived after its gap was emitted");
            }
            Acceptance::Duplicate => {
                warn!(sequence, %worker, "duplicate result discarded");
            }
        }
        acceptance
    }

    /// Report a sequence that will never complete
    pub fn on_abandoned(&mut self, sequence: u64, now: Instant) {
        if !self.reorderer.abandon(sequence, now) {
            debug!(sequence, "abandoned sequence was not outstanding");
        }
    }

    /// Queue raw output, such as the end-of-run record, behind everything else
    pub fn forward(&mut self, record: &EventRecord) {
        self.backlog.push_back(record.encode());
    }

    /// Apply reorder timeouts and push whatever is ready without blocking.
    /// Returns the number of records written to the output ring.
    pub fn poll(&mut self, now: Instant) -> Result<usize, RingError> {
        let emissions = self.reorderer.poll(now);
        self.queue(emissions);
        self.flush()
    }

    /// End of run: every missing sequence becomes a gap, then the backlog
    /// is written out, waiting for the consumer as long as it takes.
    pub fn finish(&mut self, stall_warning: Duration) -> Result<(), RingError> {
        let emissions = self.reorderer.finish();
        self.queue(emissions);
        self.flush_blocking(stall_warning)
    }

    /// Close the current run: missing sequences become gaps and the next
    /// run may restart its numbering. Output is queued, not flushed.
    pub fn close_run(&mut self) {
        let emissions = self.reorderer.close_run();
        self.queue(emissions);
    }

    /// Push queued records until the ring is full
    pub fn flush(&mut self) -> Result<usize, RingError> {
        let mut pushed = 0;
        while let Some(bytes) = self.backlog.front() {
            if !self.output.push_non_blocking(bytes)? {
                break;
            }
            self.backlog.pop_front();
            pushed += 1;
        }
        self.written += pushed as u64;
        Ok(pushed)
    }

    /// Push every queued record, blocking on a full output ring
    pub fn flush_blocking(&mut self, stall_warning: Duration) -> Result<(), RingError> {
        while let Some(bytes) = self.backlog.front() {
            if self.output.push_timeout(bytes, stall_warning)? {
                self.backlog.pop_front();
                self.written += 1;
            } else {
                warn!(
                    ring = self.output.name(),
                    queued = self.backlog.len(),
                    "output ring full, waiting for the consumer"
                );
            }
        }
        Ok(())
    }

    /// Whether the output side is too far behind to take more results
    pub fn is_backpressured(&self) -> bool {
        self.backlog.len() >= self.backlog_limit
    }

    /// Records waiting for room in the output ring
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    /// Sequences expected but not completed
    pub fn outstanding(&self) -> usize {
        self.reorderer.outstanding()
    }

    /// Results held back waiting for an earlier sequence
    pub fn buffered(&self) -> usize {
        self.reorderer.buffered()
    }

    /// Records written to the output ring so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Copy the collector's counters into a run summary
    pub fn fill_summary(&self, summary: &mut RunSummary) {
        let stats = self.reorderer.stats();
        summary.completed = self.completed;
        summary.failed_events = self.failed;
        summary.duplicates = self.unmatched + stats.duplicates;
        summary.stale = stats.stale;
        summary.gapped = self.gapped.clone();
    }

    fn queue(&mut self, emissions: Vec<Emission<EventRecord>>) {
        for emission in emissions {
            match emission {
                Emission::Item(sequence, record) => {
                    self.origins.remove(&sequence);
                    self.backlog.push_back(record.encode());
                }
                Emission::Gap(sequence) => {
                    let origin = self.origins.remove(&sequence).unwrap_or(Origin {
                        experiment: 0,
                        run: 0,
                    });
                    warn!(sequence, "emitting gap marker");
                    self.gapped.push(sequence);
                    self.backlog.push_back(
                        EventRecord::gap(sequence, origin.experiment, origin.run).encode(),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evtflow_logic::OrderingMode;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn collector(mode: OrderingMode, capacity: usize) -> Collector {
        let name = format!(
            "/evtflow-collect-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let config = ReorderConfig {
            mode,
            window: 16,
            timeout: Duration::from_secs(60),
        };
        Collector::new(config, RingBuffer::create(&name, capacity).unwrap())
    }

    fn drain(collector: &Collector) -> Vec<EventRecord> {
        let mut out = Vec::new();
        while let Some(bytes) = collector.output().pop_non_blocking().unwrap() {
            out.push(EventRecord::decode(&bytes).unwrap());
        }
        out
    }

    fn dispatch(collector: &mut Collector, inflight: &mut InFlightList, seqs: &[u64]) {
        for &seq in seqs {
            assert!(collector.expect(seq, 7, 3));
            inflight.store_event(seq, WorkerId((seq % 2) as u32), Vec::new());
        }
    }

    fn result(seq: u64) -> EventRecord {
        EventRecord::new(seq, 7, 3, format!("r{}", seq).into_bytes())
    }

    #[test]
    fn test_strict_order_restored() {
        let mut c = collector(OrderingMode::Strict, 4096);
        let mut inflight = InFlightList::new();
        dispatch(&mut c, &mut inflight, &[1, 2, 3, 4, 5]);
        let now = Instant::now();

        for seq in [3, 1, 2, 5, 4] {
            let worker = WorkerId((seq % 2) as u32);
            assert_eq!(
                c.on_worker_result(result(seq), worker, &mut inflight, now),
                Acceptance::Accepted
            );
        }
        c.poll(now).unwrap();

        let seqs: Vec<u64> = drain(&c).iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(inflight.is_empty());
        c.output.destroy().unwrap();
    }

    #[test]
    fn test_second_completion_discarded() {
        let mut c = collector(OrderingMode::Strict, 4096);
        let mut inflight = InFlightList::new();
        dispatch(&mut c, &mut inflight, &[1]);
        let now = Instant::now();

        assert_eq!(
            c.on_worker_result(result(1), WorkerId(1), &mut inflight, now),
            Acceptance::Accepted
        );
        // The replacement worker finishes the replayed copy too
        assert_eq!(
            c.on_worker_result(result(1), WorkerId(0), &mut inflight, now),
            Acceptance::Duplicate
        );
        c.poll(now).unwrap();
        assert_eq!(drain(&c).len(), 1);

        let mut summary = RunSummary::default();
        c.fill_summary(&mut summary);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.duplicates, 1);
        c.output.destroy().unwrap();
    }

    #[test]
    fn test_abandoned_becomes_gap_marker() {
        let mut c = collector(OrderingMode::Strict, 4096);
        let mut inflight = InFlightList::new();
        dispatch(&mut c, &mut inflight, &[1, 2, 3]);
        let now = Instant::now();

        c.on_worker_result(result(1), WorkerId(1), &mut inflight, now);
        c.on_worker_result(result(3), WorkerId(1), &mut inflight, now);
        inflight.take_worker(WorkerId(0));
        c.on_abandoned(2, now);
        c.poll(now).unwrap();

        let out = drain(&c);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].sequence, 1);
        assert!(out[1].is_gap());
        assert_eq!((out[1].sequence, out[1].experiment, out[1].run), (2, 7, 3));
        assert!(out[1].payload.is_empty());
        assert_eq!(out[2].sequence, 3);

        let mut summary = RunSummary::default();
        c.fill_summary(&mut summary);
        assert_eq!(summary.gapped, vec![2]);
        c.output.destroy().unwrap();
    }

    #[test]
    fn test_error_results_pass_through() {
        let mut c = collector(OrderingMode::BestEffort, 4096);
        let mut inflight = InFlightList::new();
        dispatch(&mut c, &mut inflight, &[4]);
        let now = Instant::now();

        let failed = EventRecord::error(4, 7, 3, "boom");
        c.on_worker_result(failed, WorkerId(0), &mut inflight, now);
        c.poll(now).unwrap();
        let out = drain(&c);
        assert!(out[0].is_error());

        let mut summary = RunSummary::default();
        c.fill_summary(&mut summary);
        assert_eq!(summary.failed_events, 1);
        assert_eq!(summary.completed, 1);
        c.output.destroy().unwrap();
    }

    #[test]
    fn test_backlog_when_output_full() {
        // Room for two 32-byte records only
        let mut c = collector(OrderingMode::BestEffort, 72).with_backlog_limit(2);
        let mut inflight = InFlightList::new();
        dispatch(&mut c, &mut inflight, &[1, 2, 3, 4]);
        let now = Instant::now();

        for seq in 1..=4 {
            c.on_worker_result(result(seq), WorkerId(0), &mut inflight, now);
        }
        assert_eq!(c.poll(now).unwrap(), 2);
        assert_eq!(c.backlog(), 2);
        assert!(c.is_backpressured());

        assert_eq!(drain(&c).len(), 2);
        assert_eq!(c.flush().unwrap(), 2);
        assert!(!c.is_backpressured());
        assert_eq!(c.written(), 4);
        c.output.destroy().unwrap();
    }

    #[test]
    fn test_finish_flushes_missing_and_end_of_run() {
        let mut c = collector(OrderingMode::Strict, 4096);
        let mut inflight = InFlightList::new();
        dispatch(&mut c, &mut inflight, &[10, 20]);
        let now = Instant::now();

        c.on_worker_result(result(20), WorkerId(0), &mut inflight, now);
        c.poll(now).unwrap();
        assert!(drain(&c).is_empty());

        c.finish(Duration::from_millis(10)).unwrap();
        c.forward(&EventRecord::end_of_run(21, 7, 3));
        c.flush().unwrap();
        let out = drain(&c);
        let seqs: Vec<u64> = out.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![10, 20, 21]);
        assert!(out[0].is_gap());
        assert!(out[2].is_end_of_run());
        c.output.destroy().unwrap();
    }
}
