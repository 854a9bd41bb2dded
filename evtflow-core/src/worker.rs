//! Worker process entry point
//!
//! A worker is started by the supervisor with the `--evt-worker` flag. It reads
//! its configuration from `EVTFLOW_*` environment variables, talks to the
//! supervisor over an inherited pipe pair (`EVTFLOW_CTRL_FD=<read>,<write>`),
//! and moves events through two shared rings:
//!
//! ```text
//! input ring ──pop──▶ EventProcessor ──push──▶ output ring
//! ```
//!
//! Processor errors and panics become error-flagged results. Only a failure
//! of the transport itself ends the worker with an error.

use crate::affinity::pin_to_cpu;
use crate::processor::{EventProcessor, ProcessError, find_processor};
use evtflow_ipc::{
    ARG_SEPARATOR, EventRecord, FailureKind, FrameError, FrameReader, FrameWriter, PROTOCOL_VERSION,
    PollResult, RecordHeader, RingBuffer, RingError, SupervisorCommand, WorkerHello,
    WorkerMessage, env, wait_for_data,
};
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default heartbeat interval when `EVTFLOW_HEARTBEAT_MS` is unset
const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(500);

/// Longest a single pop waits before the loop checks for commands again
const MAX_POP_WAIT: Duration = Duration::from_millis(250);

/// Set by the SIGTERM handler
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Whether SIGTERM (or [`request_shutdown`]) asked the worker to stop
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Ask the worker loop to stop after the current record
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_sigterm_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigterm_handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Errors that end a worker
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid worker environment {name}: {reason}")]
    Env { name: &'static str, reason: String },

    #[error("processor not found: {0}")]
    ProcessorNotFound(String),

    #[error("processor {name} could not be created: {source}")]
    Processor {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("could not attach ring: {0}")]
    Attach(#[source] RingError),

    #[error("ring failure: {0}")]
    Ring(#[from] RingError),

    #[error("control pipe failure: {0}")]
    Frame(#[from] FrameError),
}

impl WorkerError {
    /// Category reported to the supervisor
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WorkerError::ProcessorNotFound(_) => FailureKind::ProcessorNotFound,
            WorkerError::Processor { .. } => FailureKind::InvalidArguments,
            WorkerError::Attach(_) => FailureKind::AttachFailed,
            WorkerError::Env { .. } | WorkerError::Ring(_) | WorkerError::Frame(_) => {
                FailureKind::Fatal
            }
        }
    }
}

/// Everything a worker needs to know, normally taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Slot id
    pub worker_id: u32,
    /// Ring to pop events from
    pub input_ring: String,
    /// Ring to push results to
    pub output_ring: String,
    /// Registered processor name
    pub processor: String,
    /// Processor arguments
    pub args: Vec<String>,
    /// Interval between heartbeats
    pub heartbeat: Duration,
    /// CPU to pin to
    pub pin_cpu: Option<usize>,
}

impl WorkerOptions {
    /// Read options from `EVTFLOW_*` variables
    pub fn from_env() -> Result<Self, WorkerError> {
        let heartbeat = match std::env::var(env::HEARTBEAT_MS) {
            Ok(_) => Duration::from_millis(parse_env::<u64>(env::HEARTBEAT_MS)?.max(1)),
            Err(_) => DEFAULT_HEARTBEAT,
        };
        let pin_cpu = match std::env::var(env::PIN_CPU) {
            Ok(_) => Some(parse_env::<usize>(env::PIN_CPU)?),
            Err(_) => None,
        };
        Ok(Self {
            worker_id: parse_env(env::WORKER_ID)?,
            input_ring: require_env(env::INPUT_RING)?,
            output_ring: require_env(env::OUTPUT_RING)?,
            processor: require_env(env::PROCESSOR)?,
            args: std::env::var(env::PROCESSOR_ARGS)
                .map(|packed| Self::decode_args(&packed))
                .unwrap_or_default(),
            heartbeat,
            pin_cpu,
        })
    }

    /// Pack processor arguments into one environment value
    pub fn encode_args(args: &[String]) -> String {
        args.join(&ARG_SEPARATOR.to_string())
    }

    /// Inverse of [`WorkerOptions::encode_args`]
    pub fn decode_args(packed: &str) -> Vec<String> {
        if packed.is_empty() {
            return Vec::new();
        }
        packed.split(ARG_SEPARATOR).map(str::to_string).collect()
    }
}

fn require_env(name: &'static str) -> Result<String, WorkerError> {
    std::env::var(name).map_err(|e| WorkerError::Env {
        name,
        reason: e.to_string(),
    })
}

fn parse_env<T>(name: &'static str) -> Result<T, WorkerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    require_env(name)?.parse().map_err(|e: T::Err| WorkerError::Env {
        name,
        reason: e.to_string(),
    })
}

/// What the control pipe had to say
#[derive(Debug, PartialEq, Eq)]
enum Control {
    Idle,
    Command(SupervisorCommand),
    Closed,
}

/// Worker end of the control pipe pair
pub struct ControlChannel {
    read_fd: RawFd,
    reader: FrameReader<File>,
    writer: FrameWriter<File>,
}

impl ControlChannel {
    /// Wrap an owned pipe pair
    pub fn from_fds(read: OwnedFd, write: OwnedFd) -> Self {
        Self {
            read_fd: read.as_raw_fd(),
            reader: FrameReader::new(File::from(read)),
            writer: FrameWriter::new(File::from(write)),
        }
    }

    /// Take over the descriptors named by `EVTFLOW_CTRL_FD`
    pub fn from_env() -> Result<Self, WorkerError> {
        let value = require_env(env::CTRL_FD)?;
        let invalid = || WorkerError::Env {
            name: env::CTRL_FD,
            reason: format!("expected <read_fd>,<write_fd>, got {:?}", value),
        };
        let (read, write) = value.split_once(',').ok_or_else(invalid)?;
        let read: RawFd = read.trim().parse().map_err(|_| invalid())?;
        let write: RawFd = write.trim().parse().map_err(|_| invalid())?;
        if read < 0 || write < 0 || read == write {
            return Err(invalid());
        }
        // SAFETY: the supervisor dup'ed these descriptors for us and nothing
        // else in this process owns them
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };
        Ok(Self::from_fds(read, write))
    }

    /// Send one message to the supervisor
    pub fn send(&mut self, message: &WorkerMessage) -> Result<(), FrameError> {
        self.writer.write(message)
    }

    fn poll(&mut self) -> Result<Control, WorkerError> {
        if !self.reader.has_buffered_data() {
            match wait_for_data(self.read_fd, Duration::ZERO) {
                PollResult::DataAvailable => {}
                PollResult::Timeout => return Ok(Control::Idle),
                PollResult::PipeClosed => return Ok(Control::Closed),
                PollResult::Error(e) => return Err(FrameError::Io(e).into()),
            }
        }
        match self.reader.read::<SupervisorCommand>() {
            Ok(command) => Ok(Control::Command(command)),
            Err(FrameError::EndOfStream) => Ok(Control::Closed),
            Err(e) => Err(e.into()),
        }
    }
}

/// Success and failure counts reported in heartbeats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    processed: u64,
    failed: u64,
}

/// Worker main loop
pub struct WorkerMain {
    options: WorkerOptions,
    control: ControlChannel,
    counters: Counters,
}

impl WorkerMain {
    /// Build a worker from explicit options and an open control channel
    pub fn new(options: WorkerOptions, control: ControlChannel) -> Self {
        Self {
            options,
            control,
            counters: Counters::default(),
        }
    }

    /// Build a worker from the environment the supervisor prepared
    pub fn from_env() -> Result<Self, WorkerError> {
        let mut control = ControlChannel::from_env()?;
        match WorkerOptions::from_env() {
            Ok(options) => Ok(Self::new(options, control)),
            Err(e) => {
                let _ = control.send(&WorkerMessage::Failure {
                    kind: e.failure_kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Run until told to stop. Setup failures are reported to the
    /// supervisor before being returned.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        install_sigterm_handler();

        if let Some(cpu) = self.options.pin_cpu {
            if let Err(e) = pin_to_cpu(cpu) {
                warn!(cpu, "could not pin worker: {}", e);
            }
        }

        let result = self.serve();
        if let Err(e) = &result {
            error!(worker = self.options.worker_id, "worker failed: {}", e);
            let _ = self.control.send(&WorkerMessage::Failure {
                kind: e.failure_kind(),
                message: e.to_string(),
            });
        }
        result
    }

    fn serve(&mut self) -> Result<(), WorkerError> {
        let def = find_processor(&self.options.processor)
            .ok_or_else(|| WorkerError::ProcessorNotFound(self.options.processor.clone()))?;
        let mut processor =
            (def.factory)(&self.options.args).map_err(|source| WorkerError::Processor {
                name: self.options.processor.clone(),
                source,
            })?;

        let input = RingBuffer::attach(&self.options.input_ring).map_err(WorkerError::Attach)?;
        let output = RingBuffer::attach(&self.options.output_ring).map_err(WorkerError::Attach)?;

        self.control.send(&WorkerMessage::Hello(WorkerHello {
            protocol_version: PROTOCOL_VERSION,
            worker_id: self.options.worker_id,
            pid: std::process::id(),
            processor: self.options.processor.clone(),
            input_ring: input.name().to_string(),
            output_ring: output.name().to_string(),
        }))?;
        info!(
            worker = self.options.worker_id,
            processor = %self.options.processor,
            "worker ready"
        );

        let heartbeat = self.options.heartbeat;
        let pop_wait = heartbeat.min(MAX_POP_WAIT);
        let mut last_beat = Instant::now();

        loop {
            if shutdown_requested() {
                debug!(worker = self.options.worker_id, "shutdown requested by signal");
                break;
            }
            match self.control.poll()? {
                Control::Idle => {}
                Control::Command(SupervisorCommand::Ping) => {
                    self.heartbeat()?;
                    last_beat = Instant::now();
                }
                Control::Command(SupervisorCommand::Shutdown) | Control::Closed => break,
            }

            if let Some(bytes) = input.pop_timeout(pop_wait)? {
                let encoded = self
                    .handle(processor.as_mut(), &bytes)
                    .and_then(|result| self.encode_for(&output, result));
                if let Some(encoded) = encoded {
                    if !self.deliver(&output, &encoded, &mut last_beat)? {
                        break;
                    }
                }
            }

            if last_beat.elapsed() >= heartbeat {
                self.heartbeat()?;
                last_beat = Instant::now();
            }
        }

        processor.finish();
        let _ = self.control.send(&WorkerMessage::Goodbye {
            processed: self.counters.processed,
            failed: self.counters.failed,
        });
        info!(
            worker = self.options.worker_id,
            processed = self.counters.processed,
            failed = self.counters.failed,
            "worker exiting"
        );
        Ok(())
    }

    fn handle(&mut self, processor: &mut dyn EventProcessor, bytes: &[u8]) -> Option<EventRecord> {
        match EventRecord::decode(bytes) {
            Ok(record) => Some(process_record(processor, &record, &mut self.counters)),
            Err(e) => match RecordHeader::peek(bytes) {
                Ok(header) => {
                    self.counters.failed += 1;
                    Some(EventRecord::error(
                        header.sequence,
                        header.experiment,
                        header.run,
                        &format!("undecodable record: {}", e),
                    ))
                }
                Err(_) => {
                    error!(len = bytes.len(), "dropping undecodable record: {}", e);
                    None
                }
            },
        }
    }

    /// Encode a result for the output ring. A result the ring can never hold
    /// is replaced by an error result naming its size, so the event still
    /// completes instead of taking the worker down with it.
    fn encode_for(&mut self, output: &RingBuffer, result: EventRecord) -> Option<Vec<u8>> {
        let bytes = result.encode();
        if output.fits(bytes.len()) {
            return Some(bytes);
        }

        warn!(
            worker = self.options.worker_id,
            sequence = result.sequence,
            len = bytes.len(),
            capacity = output.capacity(),
            "result does not fit in the output ring"
        );
        if !result.is_error() {
            self.counters.processed = self.counters.processed.saturating_sub(1);
            self.counters.failed += 1;
        }
        let message = format!(
            "result of {} bytes exceeds output ring of {} bytes",
            bytes.len(),
            output.capacity()
        );
        let replacement = [message.as_str(), ""]
            .into_iter()
            .map(|text| EventRecord::error(result.sequence, result.experiment, result.run, text))
            .map(|record| record.encode())
            .find(|encoded| output.fits(encoded.len()));
        if replacement.is_none() {
            error!(
                sequence = result.sequence,
                capacity = output.capacity(),
                "output ring cannot hold an empty error result, dropping it"
            );
        }
        replacement
    }

    /// Push a result, heartbeating while the output ring is full.
    /// Returns `false` if the worker was told to stop meanwhile.
    fn deliver(
        &mut self,
        output: &RingBuffer,
        bytes: &[u8],
        last_beat: &mut Instant,
    ) -> Result<bool, WorkerError> {
        loop {
            if output.push_timeout(bytes, self.options.heartbeat)? {
                return Ok(true);
            }
            if shutdown_requested() {
                return Ok(false);
            }
            match self.control.poll()? {
                Control::Command(SupervisorCommand::Shutdown) | Control::Closed => {
                    return Ok(false);
                }
                Control::Command(SupervisorCommand::Ping) | Control::Idle => {}
            }
            debug!(worker = self.options.worker_id, "output ring full, waiting");
            self.heartbeat()?;
            *last_beat = Instant::now();
        }
    }

    fn heartbeat(&mut self) -> Result<(), WorkerError> {
        self.control.send(&WorkerMessage::Heartbeat {
            processed: self.counters.processed,
            failed: self.counters.failed,
        })?;
        Ok(())
    }
}

/// Run a processor on one record, turning errors and panics into error results.
fn process_record(
    processor: &mut dyn EventProcessor,
    record: &EventRecord,
    counters: &mut Counters,
) -> EventRecord {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        processor.process(record)
    }));

    match outcome {
        Ok(Ok(payload)) => {
            counters.processed += 1;
            EventRecord::new(record.sequence, record.experiment, record.run, payload)
        }
        Ok(Err(e)) => {
            counters.failed += 1;
            warn!(sequence = record.sequence, "processing failed: {}", e);
            EventRecord::error(record.sequence, record.experiment, record.run, &e.to_string())
        }
        Err(panic) => {
            counters.failed += 1;
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            warn!(sequence = record.sequence, "processor panicked: {}", message);
            EventRecord::error(
                record.sequence,
                record.experiment,
                record.run,
                &format!("panic: {}", message),
            )
        }
    }
}

/// Entry point for `--evt-worker` mode. Returns the process exit code.
pub fn run_worker() -> i32 {
    let mut worker = match WorkerMain::from_env() {
        Ok(worker) => worker,
        Err(e) => {
            error!("worker setup failed: {}", e);
            return 2;
        }
    };
    match worker.run() {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
