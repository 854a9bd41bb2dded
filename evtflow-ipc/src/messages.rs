//! Control messages exchanged over the supervisor-worker pipe
//!
//! Event data never travels here; it goes through the rings. The pipe only
//! carries the handshake, liveness and shutdown traffic, serialized with rkyv.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Handshake sent by a worker once its rings are attached
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkerHello {
    /// Protocol version for compatibility checking
    pub protocol_version: u32,
    /// Slot id the worker was started for
    pub worker_id: u32,
    /// OS process id
    pub pid: u32,
    /// Processor the worker instantiated
    pub processor: String,
    /// Ring the worker pops from
    pub input_ring: String,
    /// Ring the worker pushes to
    pub output_ring: String,
}

/// Messages sent from worker to supervisor
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// Worker is attached and ready to take records
    Hello(WorkerHello),

    /// Periodic liveness signal with cumulative counters
    Heartbeat {
        /// Records processed successfully
        processed: u64,
        /// Records whose processing failed
        failed: u64,
    },

    /// Worker is exiting cleanly
    Goodbye {
        /// Records processed successfully
        processed: u64,
        /// Records whose processing failed
        failed: u64,
    },

    /// Worker could not start or hit an unrecoverable error
    Failure {
        /// Error category
        kind: FailureKind,
        /// Human-readable error message
        message: String,
    },
}

/// Categories of worker failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum FailureKind {
    /// Requested processor is not registered
    ProcessorNotFound,
    /// Processor factory rejected its arguments
    InvalidArguments,
    /// Input or output ring could not be attached
    AttachFailed,
    /// Anything else that stops the worker
    Fatal,
}

impl FailureKind {
    /// Whether restarting the worker cannot help
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            FailureKind::ProcessorNotFound | FailureKind::InvalidArguments
        )
    }
}

/// Commands sent from supervisor to worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum SupervisorCommand {
    /// Finish the current record and exit
    Shutdown,

    /// Request an immediate heartbeat
    Ping,
}
