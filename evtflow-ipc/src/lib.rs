#![warn(missing_docs)]
//! evtflow IPC layer
//!
//! Everything that crosses a process boundary lives here:
//! - [`RingBuffer`]: a fixed-capacity circular byte queue in a named POSIX
//!   shared-memory segment, guarded by process-shared semaphores and a robust mutex
//! - [`EventRecord`]: the fixed little-endian header wrapped around every opaque payload
//! - Length-prefixed framing and rkyv control messages for the supervisor-worker pipe

#[cfg(not(target_os = "linux"))]
compile_error!("evtflow-ipc requires Linux (process-shared semaphores and robust mutexes)");

mod arena;
mod framing;
mod messages;
mod record;
mod ring_buffer;
mod shm;
mod sync;

pub use arena::Arena;
pub use framing::{
    FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, PollResult, read_raw_frame,
    wait_for_data, write_raw_frame,
};
pub use messages::{FailureKind, SupervisorCommand, WorkerHello, WorkerMessage};
pub use record::{EventRecord, RECORD_HEADER_LEN, RecordError, RecordFlags, RecordHeader};
pub use ring_buffer::{RingBuffer, RingError, RingStats, SKIP_MARKER, record_footprint};

/// Protocol version exchanged in the worker handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Default ring capacity in bytes (4 MiB)
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// Command-line flag that switches the evtflow binary into worker mode
pub const WORKER_FLAG: &str = "--evt-worker";

/// Environment variables through which the supervisor configures a worker process
pub mod env {
    /// Numeric worker slot id
    pub const WORKER_ID: &str = "EVTFLOW_WORKER_ID";
    /// Name of the ring the worker pops records from
    pub const INPUT_RING: &str = "EVTFLOW_INPUT_RING";
    /// Name of the ring the worker pushes results to
    pub const OUTPUT_RING: &str = "EVTFLOW_OUTPUT_RING";
    /// Registered processor name
    pub const PROCESSOR: &str = "EVTFLOW_PROCESSOR";
    /// Processor arguments, separated by ASCII unit separators (0x1f)
    pub const PROCESSOR_ARGS: &str = "EVTFLOW_PROCESSOR_ARGS";
    /// Heartbeat interval in milliseconds
    pub const HEARTBEAT_MS: &str = "EVTFLOW_HEARTBEAT_MS";
    /// Control pipe descriptors as `<read_fd>,<write_fd>`
    pub const CTRL_FD: &str = "EVTFLOW_CTRL_FD";
    /// CPU the worker should pin itself to
    pub const PIN_CPU: &str = "EVTFLOW_PIN_CPU";
}

/// Separator used to pack processor arguments into a single environment variable
pub const ARG_SEPARATOR: char = '\u{1f}';

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity_is_aligned() {
        assert_eq!(DEFAULT_RING_CAPACITY % 4, 0);
    }

    #[test]
    fn test_record_header_fits_small_ring() {
        // An empty event must fit a ring sized for a single header
        assert!(record_footprint(RECORD_HEADER_LEN) <= 32);
    }
}
