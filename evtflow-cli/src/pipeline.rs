//! Supervisor event loop
//!
//! One thread drives everything. Each iteration:
//!
//! 1. poll worker health and control pipes, handle deaths
//! 2. declare workers dead whose oldest in-flight event is overdue
//! 3. respawn workers whose restart backoff has passed
//! 4. drain worker output rings into the collector
//! 5. dispatch reclaimed and new input records
//! 6. release ordered results to the output ring
//!
//! and sleeps `poll_interval` when nothing moved. An end-of-run record on
//! the input, or SIGINT/SIGTERM, stops intake; the loop then drains what is
//! in flight before flushing the collector.
//!
//! Sequence numbers are scoped to an `(experiment, run)` pair. A record from
//! a different pair pauses intake until the current run has settled, then
//! starts ordering afresh.

use crate::collector::Collector;
use crate::distributor::{
    DispatchError, DispatchFailure, DispatchPolicy, Distributor, PendingRecord,
};
use crate::supervisor::{DeathCause, PoolSettings, SupervisorError, WorkerPool, WorkerState};
use evtflow_ipc::{
    EventRecord, RECORD_HEADER_LEN, RecordError, RecordFlags, RecordHeader, RingBuffer,
    record_footprint,
};
use evtflow_logic::{InFlightList, ReorderConfig, RunSummary, WorkerId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Records pulled from the input ahead of dispatch
const PENDING_LIMIT: usize = 256;

/// Results taken from one worker per iteration
const COLLECT_BATCH: usize = 256;

/// Time workers get to exit after the shutdown command
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How often a blocked output push logs a warning
const OUTPUT_STALL_WARNING: Duration = Duration::from_secs(5);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn interrupt_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_interrupt_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = interrupt_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

/// Whether SIGINT or SIGTERM reached the supervisor
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Everything the event loop needs, resolved from configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Ring the supervisor pulls events from
    pub input_ring: String,
    /// Ring results are emitted on
    pub output_ring: String,
    /// Capacity used when the input or output ring has to be created
    pub capacity: usize,
    pub pool: PoolSettings,
    pub policy: DispatchPolicy,
    /// Per-worker in-flight cap, 0 for none
    pub max_in_flight: usize,
    /// Dispatches of one event before it is abandoned
    pub max_attempts: u32,
    pub reorder: ReorderConfig,
    /// Sleep between idle loop iterations
    pub poll_interval: Duration,
    /// How long a drain may go without a completion
    pub drain_timeout: Duration,
}

/// The supervising process: input ring → workers → output ring
pub struct Pipeline {
    settings: PipelineSettings,
    input: RingBuffer,
    pool: WorkerPool,
    inflight: InFlightList,
    distributor: Distributor,
    collector: Collector,
    pending: VecDeque<PendingRecord>,
    last_sequence: Option<u64>,
    /// `(experiment, run)` of the records being admitted
    current_run: Option<(u32, u32)>,
    /// First record of the next run, held until the current one settles
    next_run: Option<(RecordHeader, Vec<u8>)>,
    end_of_run: Option<EventRecord>,
    draining: bool,
    last_progress: Instant,
    understaffed_since: Option<Instant>,
    started: Instant,
    summary: RunSummary,
}

impl Pipeline {
    /// Attach to (or create) the input and output rings and create the
    /// worker rings. No worker is started yet.
    pub fn new(settings: PipelineSettings) -> Result<Self, SupervisorError> {
        let input = RingBuffer::open_or_create(&settings.input_ring, settings.capacity)?;
        let output = RingBuffer::open_or_create(&settings.output_ring, settings.capacity)?;
        let pool = WorkerPool::new(settings.pool.clone())?;
        let summary = RunSummary {
            mode: settings.reorder.mode.to_string(),
            ..RunSummary::default()
        };
        let now = Instant::now();
        Ok(Self {
            input,
            pool,
            inflight: InFlightList::new(),
            distributor: Distributor::new(settings.policy, settings.max_in_flight),
            collector: Collector::new(settings.reorder, output),
            pending: VecDeque::new(),
            last_sequence: None,
            current_run: None,
            next_run: None,
            end_of_run: None,
            draining: false,
            last_progress: now,
            understaffed_since: None,
            started: now,
            summary,
            settings,
        })
    }

    /// Run until end of run (or a signal), then stop the workers and remove
    /// their rings. The input and output rings are left for their owners.
    pub fn run(mut self) -> Result<RunSummary, SupervisorError> {
        install_interrupt_handlers();
        info!(
            input = self.input.name(),
            output = self.collector.output().name(),
            workers = self.settings.pool.workers,
            processor = %self.settings.pool.processor,
            policy = %self.distributor.policy(),
            mode = %self.settings.reorder.mode,
            "starting pipeline"
        );

        let outcome = self
            .pool
            .start()
            .and_then(|_| self.event_loop())
            .and_then(|_| self.finish());

        self.pool.shutdown(SHUTDOWN_GRACE);
        let summary = self.build_summary();
        if let Err(e) = self.pool.destroy() {
            warn!("worker ring cleanup failed: {}", e);
        }
        outcome.map(|_| summary)
    }

    fn event_loop(&mut self) -> Result<(), SupervisorError> {
        loop {
            let now = Instant::now();
            if !self.draining && interrupted() {
                warn!("interrupted, draining in-flight events");
                self.summary.interrupted = true;
                self.begin_drain(now);
            }

            for (id, cause) in self.pool.poll_health(now)? {
                self.handle_death(id, cause, now)?;
            }

            // Results stuck behind a full output ring are not the worker's fault
            if !self.collector.is_backpressured() {
                let liveness = self.settings.pool.liveness_timeout;
                while let Some(worker) = self.inflight.check_for_timeout_at(liveness, now) {
                    let sequence = self.inflight.oldest().map_or(0, |e| e.sequence);
                    self.handle_death(worker, DeathCause::Timeout { sequence }, now)?;
                }
            }

            for id in self.pool.restart_due(now)? {
                debug!(worker = %id, "worker respawned");
            }

            let mut progress = self.collect(now)?;
            progress |= self.dispatch_pending(now)?;
            if !self.draining {
                progress |= self.start_next_run();
            }
            if !self.draining && self.pull_input(now)? {
                progress = true;
                self.dispatch_pending(now)?;
            }
            progress |= self.collector.poll(now)? > 0;
            self.check_staffing(now)?;

            if self.draining {
                if self.pending.is_empty() && self.inflight.is_empty() {
                    self.drop_next_run();
                    info!("all in-flight events settled");
                    return Ok(());
                }
                let quiet = now.saturating_duration_since(self.last_progress);
                if quiet > self.settings.drain_timeout {
                    warn!(
                        pending = self.pending.len(),
                        in_flight = self.inflight.len(),
                        "drain timed out, abandoning remaining events"
                    );
                    self.abandon_everything(now);
                    self.drop_next_run();
                    return Ok(());
                }
            }

            if !progress {
                std::thread::sleep(self.settings.poll_interval);
            }
        }
    }

    fn begin_drain(&mut self, now: Instant) {
        self.draining = true;
        self.last_progress = now;
    }

    /// Pull records from the input ring into the pending queue
    fn pull_input(&mut self, now: Instant) -> Result<bool, SupervisorError> {
        let mut pulled = false;
        while self.pending.len() < PENDING_LIMIT
            && self.next_run.is_none()
            && !self.collector.is_backpressured()
        {
            let Some(bytes) = self.input.pop_non_blocking()? else {
                break;
            };
            pulled = true;

            let header = match validate(&bytes) {
                Ok(header) => header,
                Err(e) => {
                    warn!("rejecting malformed input record: {}", e);
                    self.summary.rejected += 1;
                    continue;
                }
            };

            if header.flags.contains(RecordFlags::END_OF_RUN) {
                match EventRecord::decode(&bytes) {
                    Ok(record) => {
                        info!(
                            sequence = header.sequence,
                            experiment = header.experiment,
                            run = header.run,
                            "end of run received"
                        );
                        self.end_of_run = Some(record);
                    }
                    Err(e) => warn!("end-of-run record does not decode: {}", e),
                }
                self.begin_drain(now);
                break;
            }

            if record_footprint(bytes.len()) > self.settings.pool.ring_capacity {
                warn!(
                    sequence = header.sequence,
                    len = bytes.len(),
                    capacity = self.settings.pool.ring_capacity,
                    "rejecting input record too large for a worker ring"
                );
                self.summary.rejected += 1;
                continue;
            }

            let run = (header.experiment, header.run);
            if self.current_run.is_some_and(|current| current != run) {
                info!(
                    experiment = header.experiment,
                    run = header.run,
                    "next run on the input, settling the current one first"
                );
                self.next_run = Some((header, bytes));
                break;
            }
            self.current_run = Some(run);

            if self.last_sequence.is_some_and(|last| header.sequence <= last) {
                warn!(
                    sequence = header.sequence,
                    last = self.last_sequence,
                    "rejecting out-of-order input sequence"
                );
                self.summary.rejected += 1;
                continue;
            }
            self.admit(header, bytes);
        }
        Ok(pulled)
    }

    fn admit(&mut self, header: RecordHeader, bytes: Vec<u8>) {
        self.last_sequence = Some(header.sequence);
        self.collector
            .expect(header.sequence, header.experiment, header.run);
        self.summary.input_records += 1;
        self.pending
            .push_back(PendingRecord::new(header.sequence, bytes));
    }

    /// Once every event of the current run is settled, flush its ordering
    /// state and admit the held first record of the next run.
    fn start_next_run(&mut self) -> bool {
        if !self.pending.is_empty() || !self.inflight.is_empty() {
            return false;
        }
        let Some((header, bytes)) = self.next_run.take() else {
            return false;
        };
        self.collector.close_run();
        self.last_sequence = None;
        self.current_run = Some((header.experiment, header.run));
        debug!(
            experiment = header.experiment,
            run = header.run,
            "starting next run"
        );
        self.admit(header, bytes);
        true
    }

    /// A drain ended intake while the next run's first record was held back
    fn drop_next_run(&mut self) {
        if let Some((header, _)) = self.next_run.take() {
            warn!(
                sequence = header.sequence,
                experiment = header.experiment,
                run = header.run,
                "stopped before the next run started, dropping its first record"
            );
            self.summary.rejected += 1;
        }
    }

    /// Hand pending records to workers until they push back
    fn dispatch_pending(&mut self, now: Instant) -> Result<bool, SupervisorError> {
        let mut progress = false;
        while let Some(record) = self.pending.pop_front() {
            let first = record.attempts == 0;
            match self
                .distributor
                .dispatch(record, self.pool.slots(), &mut self.inflight, now)
            {
                Ok(worker) => {
                    progress = true;
                    self.pool.note_dispatch(worker);
                    if first {
                        self.summary.dispatched += 1;
                    } else {
                        self.summary.redispatched += 1;
                    }
                }
                Err(DispatchFailure { record, error }) => match error {
                    DispatchError::RecordTooLarge {
                        sequence,
                        len,
                        capacity,
                    } => {
                        error!(sequence, len, capacity, "record can never fit a worker ring");
                        self.summary.abandoned.push(sequence);
                        self.collector.on_abandoned(sequence, now);
                    }
                    DispatchError::Ring { worker, source } => {
                        self.pending.push_front(record);
                        self.handle_death(worker, DeathCause::Ring(source.to_string()), now)?;
                    }
                    DispatchError::NoWorkerAvailable | DispatchError::Saturated => {
                        self.pending.push_front(record);
                        break;
                    }
                },
            }
        }
        Ok(progress)
    }

    /// Move finished results from live workers to the collector
    fn collect(&mut self, now: Instant) -> Result<bool, SupervisorError> {
        if self.collector.is_backpressured() {
            return Ok(false);
        }
        let mut touched = Vec::new();
        let mut deaths = Vec::new();

        for slot in self.pool.slots() {
            if !slot.state().is_live() {
                continue;
            }
            let id = slot.id();
            let mut taken = 0;
            while taken < COLLECT_BATCH {
                match slot.output().pop_non_blocking() {
                    Ok(Some(bytes)) => {
                        taken += 1;
                        match EventRecord::decode(&bytes) {
                            Ok(record) => {
                                self.collector
                                    .on_worker_result(record, id, &mut self.inflight, now);
                            }
                            Err(e) => {
                                deaths.push((id, DeathCause::Malformed(e.to_string())));
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        deaths.push((id, DeathCause::Ring(e.to_string())));
                        break;
                    }
                }
            }
            if taken > 0 {
                touched.push(id);
            }
        }

        for &id in &touched {
            let load = self.inflight.count_for(id);
            self.pool.note_load(id, load);
        }
        for (id, cause) in deaths {
            self.handle_death(id, cause, now)?;
        }
        if !touched.is_empty() {
            self.last_progress = now;
        }
        Ok(!touched.is_empty())
    }

    /// Kill a worker, keep what it finished and replay what it did not.
    fn handle_death(
        &mut self,
        id: WorkerId,
        cause: DeathCause,
        now: Instant,
    ) -> Result<(), SupervisorError> {
        let Some(slot) = self.pool.slot(id) else {
            return Ok(());
        };
        let already_dead = matches!(slot.state(), WorkerState::Dead | WorkerState::Restarting);
        if already_dead && self.inflight.count_for(id) == 0 {
            return Ok(());
        }
        if !already_dead {
            self.pool.mark_dead(id, cause, now);
        }

        let salvaged = self.salvage_results(id, now);
        let reclaimed = self.inflight.take_worker(id);
        let mut replayed = 0;
        for entry in reclaimed.into_iter().rev() {
            if entry.attempts >= self.settings.max_attempts {
                error!(
                    sequence = entry.sequence,
                    attempts = entry.attempts,
                    "abandoning event after repeated worker deaths"
                );
                self.summary.abandoned.push(entry.sequence);
                self.collector.on_abandoned(entry.sequence, now);
            } else {
                replayed += 1;
                self.pending.push_front(PendingRecord {
                    sequence: entry.sequence,
                    bytes: entry.record,
                    attempts: entry.attempts,
                    avoid: Some(id),
                });
            }
        }
        if salvaged > 0 || replayed > 0 {
            info!(worker = %id, salvaged, replayed, "recovered events from dead worker");
        }

        self.pool.schedule_restart(id)
    }

    /// Collect results a dead worker pushed before it went away
    fn salvage_results(&mut self, id: WorkerId, now: Instant) -> usize {
        let Some(slot) = self.pool.slot(id) else {
            return 0;
        };
        let mut salvaged = 0;
        loop {
            match slot.output().pop_non_blocking() {
                Ok(Some(bytes)) => match EventRecord::decode(&bytes) {
                    Ok(record) => {
                        self.collector
                            .on_worker_result(record, id, &mut self.inflight, now);
                        salvaged += 1;
                    }
                    Err(e) => warn!(worker = %id, "dropping malformed result: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %id, "cannot salvage results: {}", e);
                    break;
                }
            }
        }
        salvaged
    }

    /// Fail the run if too few workers have been alive for too long
    fn check_staffing(&mut self, now: Instant) -> Result<(), SupervisorError> {
        let live = self.pool.live_count();
        let required = self.settings.pool.min_workers;
        if live >= required {
            self.understaffed_since = None;
            return Ok(());
        }
        let since = *self.understaffed_since.get_or_insert(now);
        let patience = self.settings.pool.startup_timeout + self.settings.pool.restart_backoff;
        let waited = now.saturating_duration_since(since);
        if waited > patience {
            return Err(SupervisorError::PoolExhausted {
                live,
                required,
                waited,
            });
        }
        Ok(())
    }

    fn abandon_everything(&mut self, now: Instant) {
        let pending: Vec<u64> = self.pending.drain(..).map(|r| r.sequence).collect();
        let in_flight: Vec<u64> = self.inflight.iter().map(|e| e.sequence).collect();
        for sequence in pending.into_iter().chain(in_flight) {
            let _ = self.inflight.remove_event(sequence);
            error!(sequence, "abandoning event at end of drain");
            self.summary.abandoned.push(sequence);
            self.collector.on_abandoned(sequence, now);
        }
    }

    /// Flush the collector and forward the end-of-run record
    fn finish(&mut self) -> Result<(), SupervisorError> {
        let now = Instant::now();
        self.collector.poll(now)?;
        self.collector.finish(OUTPUT_STALL_WARNING)?;
        if let Some(record) = self.end_of_run.take() {
            self.collector.forward(&record);
            self.collector.flush_blocking(OUTPUT_STALL_WARNING)?;
            self.summary.end_of_run = true;
        }
        info!(written = self.collector.written(), "output flushed");
        Ok(())
    }

    fn build_summary(&mut self) -> RunSummary {
        let mut summary = std::mem::take(&mut self.summary);
        self.collector.fill_summary(&mut summary);
        summary.abandoned.sort_unstable();
        summary.elapsed_secs = self.started.elapsed().as_secs_f64();
        summary.workers = self.pool.summaries();
        summary
    }
}

/// Header of a well-formed input record
fn validate(bytes: &[u8]) -> Result<RecordHeader, RecordError> {
    let header = RecordHeader::peek(bytes)?;
    let actual = bytes.len() - RECORD_HEADER_LEN;
    if header.payload_len as usize != actual {
        return Err(RecordError::LengthMismatch {
            declared: header.payload_len as usize,
            actual,
        });
    }
    Ok(header)
}
