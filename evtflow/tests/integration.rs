//! Integration tests for evtflow
//!
//! These tests drive rings, the distributor, the in-flight list and the
//! collector together inside one process, standing in for worker processes.

use evtflow::{
    Collector, DispatchPolicy, DispatchTarget, Distributor, EventProcessor, EventRecord,
    InFlightList, OrderingMode, PendingRecord, ReorderConfig, RingBuffer, WorkerId,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_name(tag: &str) -> String {
    format!(
        "evtflow-it-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Ring owned by the test; unlinked on drop
struct ScopedRing(Option<RingBuffer>);

impl ScopedRing {
    fn create(tag: &str, capacity: usize) -> Self {
        Self(Some(RingBuffer::create(&unique_name(tag), capacity).unwrap()))
    }

    fn ring(&self) -> &RingBuffer {
        self.0.as_ref().unwrap()
    }

    fn take(&mut self) -> RingBuffer {
        self.0.take().unwrap()
    }
}

impl Drop for ScopedRing {
    fn drop(&mut self) {
        if let Some(ring) = self.0.take() {
            let _ = ring.destroy();
        }
    }
}

/// Stand-in for a worker process: an input ring and a liveness switch
struct FakeWorker {
    id: WorkerId,
    alive: bool,
    input: ScopedRing,
}

impl FakeWorker {
    fn new(id: u32) -> Self {
        Self {
            id: WorkerId(id),
            alive: true,
            input: ScopedRing::create("worker", 64 * 1024),
        }
    }

    /// Pop everything queued and return passthrough results
    fn process_all(&self) -> Vec<EventRecord> {
        let mut results = Vec::new();
        while let Some(bytes) = self.input.ring().pop_non_blocking().unwrap() {
            let record = EventRecord::decode(&bytes).unwrap();
            results.push(EventRecord::new(
                record.sequence,
                record.experiment,
                record.run,
                record.payload,
            ));
        }
        results
    }
}

impl DispatchTarget for FakeWorker {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    fn accepts_work(&self) -> bool {
        self.alive
    }

    fn input_ring(&self) -> &RingBuffer {
        self.input.ring()
    }
}

fn drain_output(ring: &RingBuffer) -> Vec<EventRecord> {
    let mut out = Vec::new();
    while let Some(bytes) = ring.pop_timeout(Duration::from_millis(100)).unwrap() {
        out.push(EventRecord::decode(&bytes).unwrap());
    }
    out
}

/// Records written by one handle come out of another, in order
#[test]
fn test_ring_shared_between_handles() {
    let owner = ScopedRing::create("shared", 4096);
    let reader = RingBuffer::attach(owner.ring().name()).unwrap();

    for seq in 1..=8u64 {
        let record = EventRecord::new(seq, 1, 1, vec![seq as u8; 16]);
        owner.ring().push(&record.encode()).unwrap();
    }
    assert_eq!(reader.len().unwrap(), 8);

    for seq in 1..=8u64 {
        let record = EventRecord::decode(&reader.pop().unwrap()).unwrap();
        assert_eq!(record.sequence, seq);
        assert_eq!(record.payload, vec![seq as u8; 16]);
    }
    assert!(reader.is_empty().unwrap());
}

/// A worker dies with events in flight; they are replayed on the survivor
/// and the output still arrives complete and in order.
#[test]
fn test_worker_death_replays_in_flight_events() {
    let mut workers = vec![FakeWorker::new(0), FakeWorker::new(1)];
    let mut output = ScopedRing::create("output", 64 * 1024);
    let mut inflight = InFlightList::new();
    let mut distributor = Distributor::new(DispatchPolicy::RoundRobin, 0);
    let mut collector = Collector::new(ReorderConfig::default(), output.take());
    let now = Instant::now();

    for seq in 1..=6u64 {
        let record = EventRecord::new(seq, 2, 9, seq.to_le_bytes().to_vec());
        collector.expect(seq, 2, 9);
        distributor
            .dispatch(
                PendingRecord::new(seq, record.encode()),
                &workers,
                &mut inflight,
                now,
            )
            .unwrap();
    }
    assert_eq!(inflight.count_for(WorkerId(0)), 3);
    assert_eq!(inflight.count_for(WorkerId(1)), 3);

    // Worker 1 finishes its share, worker 0 crashes before answering
    for result in workers[1].process_all() {
        collector.on_worker_result(result, WorkerId(1), &mut inflight, now);
    }
    workers[0].alive = false;
    workers[0].input.ring().clear().unwrap();
    let reclaimed = inflight.take_worker(WorkerId(0));
    assert_eq!(
        reclaimed.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![1, 3, 5]
    );

    for entry in reclaimed {
        let mut pending = PendingRecord::new(entry.sequence, entry.record);
        pending.attempts = entry.attempts;
        pending.avoid = Some(entry.worker);
        let worker = distributor
            .dispatch(pending, &workers, &mut inflight, now)
            .unwrap();
        assert_eq!(worker, WorkerId(1));
    }
    for result in workers[1].process_all() {
        collector.on_worker_result(result, WorkerId(1), &mut inflight, now);
    }
    assert!(inflight.is_empty());

    collector.poll(now).unwrap();
    collector.forward(&EventRecord::end_of_run(7, 2, 9));
    collector.finish(Duration::from_secs(1)).unwrap();

    let out = drain_output(collector.output());
    let sequences: Vec<u64> = out.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6, 7]);
    assert!(out[..6].iter().all(|r| !r.is_gap()));
    assert!(out[6].is_end_of_run());

    let _ = RingBuffer::attach(collector.output().name()).map(|r| r.destroy());
}

/// An event given up on becomes a gap marker in its slot
#[test]
fn test_abandoned_event_leaves_a_gap() {
    let mut output = ScopedRing::create("gap", 16 * 1024);
    let mut inflight = InFlightList::new();
    let mut collector = Collector::new(ReorderConfig::default(), output.take());
    let now = Instant::now();

    for seq in 1..=3u64 {
        collector.expect(seq, 4, 1);
        inflight.store_event_at(seq, WorkerId(0), Vec::new(), 1, now);
    }
    for (seq, payload) in [(3u64, b"c"), (1, b"a")] {
        let result = EventRecord::new(seq, 4, 1, payload.to_vec());
        collector.on_worker_result(result, WorkerId(0), &mut inflight, now);
    }
    inflight.remove_event(2).unwrap();
    collector.on_abandoned(2, now);
    collector.poll(now).unwrap();

    let out = drain_output(collector.output());
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].payload, b"a");
    assert!(out[1].is_gap());
    assert_eq!(out[1].sequence, 2);
    assert_eq!((out[1].experiment, out[1].run), (4, 1));
    assert_eq!(out[2].payload, b"c");

    let _ = RingBuffer::attach(collector.output().name()).map(|r| r.destroy());
}

/// Best-effort mode forwards results as they arrive
#[test]
fn test_best_effort_forwards_in_arrival_order() {
    let mut output = ScopedRing::create("best-effort", 16 * 1024);
    let mut inflight = InFlightList::new();
    let config = ReorderConfig {
        mode: OrderingMode::BestEffort,
        ..ReorderConfig::default()
    };
    let mut collector = Collector::new(config, output.take());
    let now = Instant::now();

    for seq in [1u64, 2, 3] {
        collector.expect(seq, 0, 0);
        inflight.store_event_at(seq, WorkerId(0), Vec::new(), 1, now);
    }
    for seq in [3u64, 1, 2] {
        let result = EventRecord::new(seq, 0, 0, Vec::new());
        collector.on_worker_result(result, WorkerId(0), &mut inflight, now);
    }
    collector.poll(now).unwrap();

    let sequences: Vec<u64> = drain_output(collector.output())
        .iter()
        .map(|r| r.sequence)
        .collect();
    assert_eq!(sequences, vec![3, 1, 2]);

    let _ = RingBuffer::attach(collector.output().name()).map(|r| r.destroy());
}

/// Built-in processors are reachable through the facade
#[test]
fn test_builtin_processors_registered() {
    let names: Vec<&str> = evtflow::registered_processors()
        .iter()
        .map(|def| def.name)
        .collect();
    for name in ["chaos", "passthrough", "reverse"] {
        assert!(names.contains(&name), "missing {}", name);
    }

    let def = evtflow::registered_processors()
        .into_iter()
        .find(|def| def.name == "reverse")
        .unwrap();
    let mut processor = (def.factory)(&[]).unwrap();
    let out = processor
        .process(&EventRecord::new(1, 0, 0, b"abc".to_vec()))
        .unwrap();
    assert_eq!(out, b"cba");
}
