//! Supervisor Process
//!
//! Owns one OS process per worker slot, the slot's pair of rings and the
//! slot state machine:
//!
//! ```text
//! Starting → Ready ⇄ Busy → Dead → Restarting → Starting
//! ```
//!
//! Death is detected from process exit, a closed control pipe, a missing
//! hello or missing heartbeats. What happens to the dead worker's events is
//! the pipeline's business; the pool only kills, resets and respawns.

use evtflow_core::{WorkerOptions, available_cpus};
use evtflow_ipc::{
    FailureKind, FrameError, FrameReader, FrameWriter, PROTOCOL_VERSION, PollResult, RingBuffer,
    RingError, SupervisorCommand, WORKER_FLAG, WorkerHello, WorkerMessage, env, wait_for_data,
};
use evtflow_logic::{WorkerId, WorkerSummary};
use std::fmt;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Time a worker gets to exit after SIGTERM before it is killed
const TERM_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Worker protocol error: expected {expected}, got {got}")]
    Protocol { expected: String, got: String },

    #[error("{worker} died again after {max_restarts} restarts")]
    RestartCeilingExceeded { worker: WorkerId, max_restarts: u32 },

    #[error("only {live} of {required} required workers alive for {waited:?}")]
    PoolExhausted {
        live: usize,
        required: usize,
        waited: Duration,
    },

    #[error("only {ready} of {required} required workers became ready")]
    InsufficientWorkers { ready: usize, required: usize },

    #[error("{worker} cannot run ({kind:?}): {message}")]
    WorkerFailed {
        worker: WorkerId,
        kind: FailureKind,
        message: String,
    },

    #[error(transparent)]
    Ring(#[from] RingError),
}

impl From<FrameError> for SupervisorError {
    fn from(e: FrameError) -> Self {
        SupervisorError::Ipc(e.to_string())
    }
}

/// Pool-level settings, resolved from configuration
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of worker slots
    pub workers: usize,
    /// Live workers below which the run fails
    pub min_workers: usize,
    /// Worker rings are named `{prefix}.{id}.in` / `.out`
    pub worker_prefix: String,
    /// Capacity of each worker ring in bytes
    pub ring_capacity: usize,
    pub startup_timeout: Duration,
    /// Silence, or an in-flight event held, for longer than this is death
    pub liveness_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Restarts per slot before the run fails
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    /// Executable started with the worker flag
    pub worker_binary: PathBuf,
    /// Registered processor name
    pub processor: String,
    pub args: Vec<String>,
    /// Pin slot `n` to the `n`th allowed CPU
    pub pin_cpus: bool,
}

impl PoolSettings {
    /// Name of a worker ring
    pub fn ring_name(&self, worker: WorkerId, direction: &str) -> String {
        format!("{}.{}.{}", self.worker_prefix, worker.0, direction)
    }
}

/// Lifecycle state of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, waiting for hello
    Starting,
    /// Alive with nothing in flight
    Ready,
    /// Alive with events in flight
    Busy,
    /// Process gone, events not yet reclaimed
    Dead,
    /// Rings reset, waiting out the restart backoff
    Restarting,
}

impl WorkerState {
    /// Whether the slot may receive events
    pub fn is_live(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

/// Why a worker was declared dead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathCause {
    /// The process exited
    Exited(String),
    /// No hello within the startup timeout
    StartupTimeout,
    /// No heartbeat within the liveness timeout
    HeartbeatLost,
    /// The oldest in-flight event on this worker exceeded the liveness timeout
    Timeout { sequence: u64 },
    /// The control pipe closed while the process was still around
    ChannelClosed,
    /// A ring operation on one of the worker's rings failed
    Ring(String),
    /// The worker pushed a result that does not decode
    Malformed(String),
    /// The worker reported a failure it cannot recover from
    Failure { kind: FailureKind, message: String },
}

impl DeathCause {
    /// Deaths caused by silence rather than an observed failure
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DeathCause::StartupTimeout | DeathCause::HeartbeatLost | DeathCause::Timeout { .. }
        )
    }
}

impl fmt::Display for DeathCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathCause::Exited(status) => write!(f, "exited ({})", status),
            DeathCause::StartupTimeout => write!(f, "no hello within the startup timeout"),
            DeathCause::HeartbeatLost => write!(f, "heartbeat lost"),
            DeathCause::Timeout { sequence } => {
                write!(f, "timed out processing sequence {}", sequence)
            }
            DeathCause::ChannelClosed => write!(f, "control pipe closed"),
            DeathCause::Ring(e) => write!(f, "ring failure: {}", e),
            DeathCause::Malformed(e) => write!(f, "malformed result: {}", e),
            DeathCause::Failure { kind, message } => write!(f, "{:?}: {}", kind, message),
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        _ => status.to_string(),
    }
}

/// Create a pipe pair, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Set close-on-exec on both ends by default; we'll clear it for the ones we want to pass.
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send SIGTERM to a process. Returns `Err` if the signal could not be delivered.
fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Messages drained from a control pipe in one go
#[derive(Debug, Default)]
pub struct ChannelPoll {
    pub messages: Vec<WorkerMessage>,
    /// The worker's end is gone
    pub closed: bool,
}

/// What a worker is started with
#[derive(Debug, Clone)]
pub struct WorkerLaunch<'a> {
    pub id: WorkerId,
    pub binary: &'a std::path::Path,
    pub input_ring: &'a str,
    pub output_ring: &'a str,
    pub processor: &'a str,
    pub args: &'a [String],
    pub heartbeat: Duration,
    pub pin_cpu: Option<usize>,
}

/// Worker process handle
pub struct WorkerHandle {
    child: Child,
    reader: FrameReader<File>,
    writer: FrameWriter<File>,
    msg_read_fd: RawFd,
    hello: Option<WorkerHello>,
}

impl WorkerHandle {
    /// Spawn a worker process using fd 3/4 for the control pipe.
    ///
    /// Does not wait for the hello; it arrives through [`WorkerHandle::poll_messages`].
    pub fn spawn(launch: &WorkerLaunch<'_>) -> Result<Self, SupervisorError> {
        // cmd_pipe: supervisor writes commands → worker reads from fd 3
        let (cmd_read, cmd_write) = create_pipe()?;
        // msg_pipe: worker writes messages from fd 4 → supervisor reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        let mut command = Command::new(launch.binary);
        command
            .arg(WORKER_FLAG)
            .env(env::CTRL_FD, "3,4")
            .env(env::WORKER_ID, launch.id.0.to_string())
            .env(env::INPUT_RING, launch.input_ring)
            .env(env::OUTPUT_RING, launch.output_ring)
            .env(env::PROCESSOR, launch.processor)
            .env(env::PROCESSOR_ARGS, WorkerOptions::encode_args(launch.args))
            .env(
                env::HEARTBEAT_MS,
                launch.heartbeat.as_millis().max(1).to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            // Own process group: a terminal Ctrl-C reaches the supervisor only
            .process_group(0);
        match launch.pin_cpu {
            Some(cpu) => command.env(env::PIN_CPU, cpu.to_string()),
            None => command.env_remove(env::PIN_CPU),
        };

        // In the child: dup cmd_read→3, msg_write→4, close originals.
        unsafe {
            command.pre_exec(move || {
                if cmd_read != 3 {
                    libc::dup2(cmd_read, 3);
                    libc::close(cmd_read);
                }
                let flags = libc::fcntl(3, libc::F_GETFD);
                libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                if msg_write != 4 {
                    libc::dup2(msg_write, 4);
                    libc::close(msg_write);
                }
                let flags = libc::fcntl(4, libc::F_GETFD);
                libc::fcntl(4, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                // Close the parent-side ends that leaked into the child
                libc::close(cmd_write);
                libc::close(msg_read);

                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(SupervisorError::SpawnFailed(e));
            }
        };

        // Close the child-side ends in the parent
        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { File::from_raw_fd(msg_read) };

        debug!(worker = %launch.id, pid = child.id(), "spawned worker");
        Ok(Self {
            child,
            reader: FrameReader::new(reader_file),
            writer: FrameWriter::new(writer_file),
            msg_read_fd: msg_read,
            hello: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// The worker's hello, once received
    pub fn hello(&self) -> Option<&WorkerHello> {
        self.hello.as_ref()
    }

    /// Validate and remember a hello
    fn accept_hello(&mut self, id: WorkerId, hello: WorkerHello) -> Result<(), SupervisorError> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(SupervisorError::Protocol {
                expected: format!("protocol version {}", PROTOCOL_VERSION),
                got: format!("protocol version {}", hello.protocol_version),
            });
        }
        if hello.worker_id != id.0 {
            return Err(SupervisorError::Protocol {
                expected: format!("hello from {}", id),
                got: format!("hello from {}", WorkerId(hello.worker_id)),
            });
        }
        self.hello = Some(hello);
        Ok(())
    }

    /// Read every complete message already waiting, without blocking.
    pub fn poll_messages(&mut self) -> Result<ChannelPoll, SupervisorError> {
        let mut poll = ChannelPoll::default();
        loop {
            if !self.reader.has_buffered_data() {
                match wait_for_data(self.msg_read_fd, Duration::ZERO) {
                    PollResult::DataAvailable => {}
                    PollResult::Timeout => break,
                    PollResult::PipeClosed => {
                        poll.closed = true;
                        break;
                    }
                    PollResult::Error(e) => {
                        return Err(SupervisorError::Ipc(format!("Pipe error: {}", e)));
                    }
                }
            }
            match self.reader.read::<WorkerMessage>() {
                Ok(message) => poll.messages.push(message),
                Err(FrameError::EndOfStream) => {
                    poll.closed = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(poll)
    }

    /// Send a command to the worker
    pub fn send(&mut self, command: SupervisorCommand) -> Result<(), SupervisorError> {
        self.writer.write(&command)?;
        Ok(())
    }

    /// Exit status if the process has exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Check if worker process is still running
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the process.
    pub fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status() {
            return Some(status);
        }
        // Ignore error: worker may already be dead
        let _ = send_sigterm(self.child.id());
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.exit_status() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let _ = self.child.kill();
        self.child.wait().ok()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            self.terminate(TERM_GRACE);
        }
    }
}

/// Counters reported by one incarnation of a worker
#[derive(Debug, Clone, Copy, Default)]
struct Reported {
    processed: u64,
    failed: u64,
}

/// One worker position in the pool: process, rings and bookkeeping
pub struct WorkerSlot {
    id: WorkerId,
    state: WorkerState,
    handle: Option<WorkerHandle>,
    input: RingBuffer,
    output: RingBuffer,
    restarts: u32,
    started_at: Instant,
    last_seen: Instant,
    pinged: bool,
    died_at: Option<Instant>,
    last_cause: Option<DeathCause>,
    pin_cpu: Option<usize>,
    retired: Reported,
    current: Reported,
    summary: WorkerSummary,
}

impl WorkerSlot {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Ring the worker pops events from
    pub fn input(&self) -> &RingBuffer {
        &self.input
    }

    /// Ring the worker pushes results to
    pub fn output(&self) -> &RingBuffer {
        &self.output
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn last_cause(&self) -> Option<&DeathCause> {
        self.last_cause.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(WorkerHandle::pid)
    }

    pub fn summary(&self) -> WorkerSummary {
        let mut summary = self.summary.clone();
        summary.processed = self.retired.processed + self.current.processed;
        summary.failed = self.retired.failed + self.current.failed;
        summary.restarts = self.restarts;
        summary
    }

    fn retire_counters(&mut self) {
        self.retired.processed += self.current.processed;
        self.retired.failed += self.current.failed;
        self.current = Reported::default();
    }
}

/// Fixed-size pool of supervised worker processes
pub struct WorkerPool {
    settings: PoolSettings,
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    /// Create every worker ring. No process is started yet.
    pub fn new(settings: PoolSettings) -> Result<Self, SupervisorError> {
        let cpus = if settings.pin_cpus {
            available_cpus()
        } else {
            Vec::new()
        };
        let now = Instant::now();
        let mut slots = Vec::with_capacity(settings.workers);
        for index in 0..settings.workers {
            let id = WorkerId(index as u32);
            let input = RingBuffer::create(&settings.ring_name(id, "in"), settings.ring_capacity)?;
            let output =
                RingBuffer::create(&settings.ring_name(id, "out"), settings.ring_capacity)?;
            slots.push(WorkerSlot {
                id,
                state: WorkerState::Restarting,
                handle: None,
                input,
                output,
                restarts: 0,
                started_at: now,
                last_seen: now,
                pinged: false,
                died_at: None,
                last_cause: None,
                pin_cpu: (!cpus.is_empty()).then(|| cpus[index % cpus.len()]),
                retired: Reported::default(),
                current: Reported::default(),
                summary: WorkerSummary::new(id),
            });
        }
        Ok(Self { settings, slots })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn slot(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(id.0 as usize)
    }

    fn slot_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(id.0 as usize)
    }

    /// Workers that may receive events
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_live()).count()
    }

    /// Workers spawned but not yet ready
    pub fn starting_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == WorkerState::Starting)
            .count()
    }

    /// Spawn every worker and wait for them to report ready.
    ///
    /// Workers that miss the startup timeout are left to the restart cycle;
    /// fewer than `min_workers` ready workers is an error.
    pub fn start(&mut self) -> Result<usize, SupervisorError> {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            self.spawn_slot(index, now);
        }

        loop {
            let now = Instant::now();
            for (id, cause) in self.poll_health(now)? {
                self.mark_dead(id, cause, now);
                self.schedule_restart(id)?;
            }
            if self.starting_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        let ready = self.live_count();
        if ready < self.settings.min_workers {
            return Err(SupervisorError::InsufficientWorkers {
                ready,
                required: self.settings.min_workers,
            });
        }
        info!(ready, workers = self.slots.len(), "worker pool started");
        Ok(ready)
    }

    fn spawn_slot(&mut self, index: usize, now: Instant) {
        let settings = &self.settings;
        let slot = &mut self.slots[index];
        let launch = WorkerLaunch {
            id: slot.id,
            binary: &settings.worker_binary,
            input_ring: slot.input.name(),
            output_ring: slot.output.name(),
            processor: &settings.processor,
            args: &settings.args,
            heartbeat: settings.heartbeat_interval,
            pin_cpu: slot.pin_cpu,
        };
        slot.started_at = now;
        slot.last_seen = now;
        slot.pinged = false;
        match WorkerHandle::spawn(&launch) {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.state = WorkerState::Starting;
            }
            Err(e) => {
                warn!(worker = %slot.id, "failed to spawn worker: {}", e);
                slot.state = WorkerState::Restarting;
                slot.died_at = Some(now);
                slot.last_cause = Some(DeathCause::Exited(e.to_string()));
                slot.summary.last_death = Some(format!("spawn failed: {}", e));
            }
        }
    }

    /// Read control traffic and look for dead workers.
    ///
    /// Returns the workers that died since the last call; they stay in their
    /// current state until [`WorkerPool::mark_dead`]. A worker reporting a
    /// permanent failure, or speaking the wrong protocol, fails the whole run.
    pub fn poll_health(
        &mut self,
        now: Instant,
    ) -> Result<Vec<(WorkerId, DeathCause)>, SupervisorError> {
        let startup_timeout = self.settings.startup_timeout;
        let liveness_timeout = self.settings.liveness_timeout;
        let mut deaths = Vec::new();

        for slot in &mut self.slots {
            if !matches!(
                slot.state,
                WorkerState::Starting | WorkerState::Ready | WorkerState::Busy
            ) {
                continue;
            }
            let Some(handle) = slot.handle.as_mut() else {
                continue;
            };

            let poll = match handle.poll_messages() {
                Ok(poll) => poll,
                Err(e) => {
                    deaths.push((slot.id, DeathCause::Ring(e.to_string())));
                    continue;
                }
            };

            let mut died = None;
            for message in poll.messages {
                slot.last_seen = now;
                slot.pinged = false;
                match message {
                    WorkerMessage::Hello(hello) => {
                        let pid = hello.pid;
                        handle.accept_hello(slot.id, hello)?;
                        if slot.state == WorkerState::Starting {
                            slot.state = WorkerState::Ready;
                            info!(worker = %slot.id, pid, restarts = slot.restarts, "worker ready");
                        }
                    }
                    WorkerMessage::Heartbeat { processed, failed }
                    | WorkerMessage::Goodbye { processed, failed } => {
                        slot.current = Reported { processed, failed };
                    }
                    WorkerMessage::Failure { kind, message } => {
                        if kind.is_permanent() {
                            return Err(SupervisorError::WorkerFailed {
                                worker: slot.id,
                                kind,
                                message,
                            });
                        }
                        died = Some(DeathCause::Failure { kind, message });
                    }
                }
            }

            let cause = if let Some(cause) = died {
                Some(cause)
            } else if let Some(status) = handle.exit_status() {
                Some(DeathCause::Exited(describe_exit(status)))
            } else if poll.closed {
                Some(DeathCause::ChannelClosed)
            } else if slot.state == WorkerState::Starting {
                (now.saturating_duration_since(slot.started_at) > startup_timeout)
                    .then_some(DeathCause::StartupTimeout)
            } else {
                let silent = now.saturating_duration_since(slot.last_seen);
                if silent > liveness_timeout {
                    Some(DeathCause::HeartbeatLost)
                } else {
                    if silent > liveness_timeout / 2 && !slot.pinged {
                        // A send failure shows up as a closed pipe on the next poll
                        let _ = handle.send(SupervisorCommand::Ping);
                        slot.pinged = true;
                    }
                    None
                }
            };
            if let Some(cause) = cause {
                deaths.push((slot.id, cause));
            }
        }
        Ok(deaths)
    }

    /// Kill and reap the worker, and record the death.
    ///
    /// The worker's rings are left untouched so its finished results can
    /// still be collected; call [`WorkerPool::schedule_restart`] afterwards.
    pub fn mark_dead(&mut self, id: WorkerId, cause: DeathCause, now: Instant) {
        let Some(slot) = self.slot_mut(id) else {
            return;
        };
        if let Some(mut handle) = slot.handle.take() {
            // Pick up a final heartbeat or goodbye if the worker left one
            if let Ok(poll) = handle.poll_messages() {
                for message in poll.messages {
                    if let WorkerMessage::Heartbeat { processed, failed }
                    | WorkerMessage::Goodbye { processed, failed } = message
                    {
                        slot.current = Reported { processed, failed };
                    }
                }
            }
            handle.terminate(TERM_GRACE);
        }
        warn!(worker = %id, cause = %cause, "worker died");
        slot.retire_counters();
        slot.state = WorkerState::Dead;
        slot.died_at = Some(now);
        if cause.is_timeout() {
            slot.summary.timeouts += 1;
        }
        slot.summary.last_death = Some(cause.to_string());
        slot.last_cause = Some(cause);
    }

    /// Reset a dead worker's rings and queue it for respawn.
    ///
    /// Leftover input is dropped (its events are replayed elsewhere); a
    /// poisoned ring is recreated under the same name.
    pub fn schedule_restart(&mut self, id: WorkerId) -> Result<(), SupervisorError> {
        let Some(slot) = self.slot_mut(id) else {
            return Ok(());
        };
        for ring in [&mut slot.input, &mut slot.output] {
            match ring.clear() {
                Ok(0) => {}
                Ok(dropped) => debug!(ring = ring.name(), dropped, "cleared worker ring"),
                Err(e) if e.requires_recreate() => {
                    warn!(ring = ring.name(), "recreating worker ring: {}", e);
                    ring.recreate_in_place()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        slot.state = WorkerState::Restarting;
        Ok(())
    }

    /// Respawn workers whose backoff has elapsed. Returns the respawned ids.
    pub fn restart_due(&mut self, now: Instant) -> Result<Vec<WorkerId>, SupervisorError> {
        let mut restarted = Vec::new();
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.state != WorkerState::Restarting {
                continue;
            }
            let due = slot
                .died_at
                .is_none_or(|died| now >= died + self.settings.restart_backoff);
            if !due {
                continue;
            }
            if slot.died_at.is_some() {
                if slot.restarts >= self.settings.max_restarts {
                    return Err(SupervisorError::RestartCeilingExceeded {
                        worker: slot.id,
                        max_restarts: self.settings.max_restarts,
                    });
                }
                self.slots[index].restarts += 1;
            }
            let slot = &self.slots[index];
            info!(worker = %slot.id, restarts = slot.restarts, "restarting worker");
            self.spawn_slot(index, now);
            if self.slots[index].state == WorkerState::Starting {
                restarted.push(self.slots[index].id);
            }
        }
        Ok(restarted)
    }

    /// Record an event handed to a worker
    pub fn note_dispatch(&mut self, id: WorkerId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.summary.dispatched += 1;
            if slot.state == WorkerState::Ready {
                slot.state = WorkerState::Busy;
            }
        }
    }

    /// Move a live worker between Ready and Busy by its in-flight count
    pub fn note_load(&mut self, id: WorkerId, in_flight: usize) {
        if let Some(slot) = self.slot_mut(id) {
            slot.state = match (slot.state, in_flight) {
                (WorkerState::Busy, 0) => WorkerState::Ready,
                (WorkerState::Ready, n) if n > 0 => WorkerState::Busy,
                (state, _) => state,
            };
        }
    }

    /// Ask every worker to exit, wait up to `grace`, then kill the stragglers.
    pub fn shutdown(&mut self, grace: Duration) {
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.as_mut() {
                if let Err(e) = handle.send(SupervisorCommand::Shutdown) {
                    debug!(worker = %slot.id, "shutdown command not delivered: {}", e);
                }
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            let mut running = 0;
            for slot in &mut self.slots {
                let Some(handle) = slot.handle.as_mut() else {
                    continue;
                };
                if let Ok(poll) = handle.poll_messages() {
                    for message in poll.messages {
                        if let WorkerMessage::Heartbeat { processed, failed }
                        | WorkerMessage::Goodbye { processed, failed } = message
                        {
                            slot.current = Reported { processed, failed };
                        }
                    }
                }
                if handle.is_alive() {
                    running += 1;
                }
            }
            if running == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        for slot in &mut self.slots {
            if let Some(mut handle) = slot.handle.take() {
                if handle.is_alive() {
                    warn!(worker = %slot.id, "worker ignored shutdown, killing it");
                }
                handle.terminate(TERM_GRACE);
            }
            slot.retire_counters();
            slot.state = WorkerState::Dead;
        }
        info!("worker pool stopped");
    }

    /// Per-worker counters
    pub fn summaries(&self) -> Vec<WorkerSummary> {
        self.slots.iter().map(WorkerSlot::summary).collect()
    }

    /// Kill whatever is still running and remove every worker ring
    pub fn destroy(self) -> Result<(), SupervisorError> {
        let mut first_error = None;
        for slot in self.slots {
            drop(slot.handle);
            for ring in [slot.input, slot.output] {
                if let Err(e) = ring.destroy() {
                    warn!("failed to destroy worker ring: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn settings(binary: &str, workers: usize) -> PoolSettings {
        PoolSettings {
            workers,
            min_workers: 1,
            worker_prefix: format!(
                "evtflow-sup-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
            ring_capacity: 4096,
            startup_timeout: Duration::from_millis(200),
            liveness_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(50),
            max_restarts: 1,
            restart_backoff: Duration::ZERO,
            worker_binary: PathBuf::from(binary),
            processor: "passthrough".to_string(),
            args: Vec::new(),
            pin_cpus: false,
        }
    }

    #[test]
    fn test_ring_names() {
        let s = settings("/bin/true", 1);
        let name = s.ring_name(WorkerId(3), "in");
        assert!(name.starts_with("evtflow-sup-"));
        assert!(name.ends_with(".3.in"));
    }

    #[test]
    fn test_death_cause_display() {
        assert_eq!(
            DeathCause::Timeout { sequence: 7 }.to_string(),
            "timed out processing sequence 7"
        );
        assert!(DeathCause::HeartbeatLost.is_timeout());
        assert!(!DeathCause::ChannelClosed.is_timeout());
    }

    #[test]
    fn test_state_liveness() {
        assert!(WorkerState::Ready.is_live());
        assert!(WorkerState::Busy.is_live());
        assert!(!WorkerState::Starting.is_live());
        assert!(!WorkerState::Restarting.is_live());
    }

    #[test]
    fn test_non_worker_binary_never_becomes_ready() {
        // /bin/true ignores the worker flag and exits without a hello
        let pool = WorkerPool::new(settings("/bin/true", 2)).unwrap();
        let mut pool = pool;
        match pool.start() {
            Err(SupervisorError::InsufficientWorkers { ready, required }) => {
                assert_eq!(ready, 0);
                assert_eq!(required, 1);
            }
            other => panic!("expected InsufficientWorkers, got {:?}", other.map(|_| ())),
        }
        assert!(pool.slots().iter().all(|s| s.state() == WorkerState::Restarting));
        assert!(
            pool.slots()
                .iter()
                .all(|s| matches!(s.last_cause(), Some(DeathCause::Exited(_))
                    | Some(DeathCause::ChannelClosed)))
        );
        pool.destroy().unwrap();
    }

    #[test]
    fn test_restart_ceiling() {
        let mut pool = WorkerPool::new(settings("/bin/true", 1)).unwrap();
        let _ = pool.start();
        let now = Instant::now();
        // First restart is allowed
        let restarted = pool.restart_due(now).unwrap();
        assert_eq!(restarted, vec![WorkerId(0)]);
        assert_eq!(pool.slots()[0].restarts(), 1);

        pool.mark_dead(WorkerId(0), DeathCause::ChannelClosed, now);
        pool.schedule_restart(WorkerId(0)).unwrap();
        assert!(matches!(
            pool.restart_due(now),
            Err(SupervisorError::RestartCeilingExceeded { .. })
        ));
        pool.destroy().unwrap();
    }

    #[test]
    fn test_missing_binary_is_left_for_restart() {
        let mut pool = WorkerPool::new(settings("/nonexistent/evtflow", 1)).unwrap();
        assert!(matches!(
            pool.start(),
            Err(SupervisorError::InsufficientWorkers { ready: 0, .. })
        ));
        assert_eq!(pool.slots()[0].state(), WorkerState::Restarting);
        assert!(pool.slots()[0].summary().last_death.is_some());
        pool.destroy().unwrap();
    }

    #[test]
    fn test_schedule_restart_clears_input() {
        let mut pool = WorkerPool::new(settings("/bin/true", 1)).unwrap();
        pool.slots()[0].input().push(b"stale").unwrap();
        pool.mark_dead(WorkerId(0), DeathCause::HeartbeatLost, Instant::now());
        assert_eq!(pool.slots()[0].state(), WorkerState::Dead);
        pool.schedule_restart(WorkerId(0)).unwrap();
        assert!(pool.slots()[0].input().is_empty().unwrap());
        assert_eq!(pool.slots()[0].summary().timeouts, 1);
        pool.destroy().unwrap();
    }
}
