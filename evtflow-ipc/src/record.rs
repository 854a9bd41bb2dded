//! Event record codec
//!
//! Every ring entry is one encoded [`EventRecord`]: a fixed little-endian
//! header followed by the opaque payload.
//!
//! ```text
//! +-----------+-------------+---------+-----------+---------------+---------+
//! | seq (u64) | experiment  | run     | flags     | payload_len   | payload |
//! |           | (u32)       | (u32)   | (u32)     | (u32)         |         |
//! +-----------+-------------+---------+-----------+---------------+---------+
//! ```

use thiserror::Error;

/// Encoded size of the record header
pub const RECORD_HEADER_LEN: usize = 24;

/// Errors raised while decoding a record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record truncated: {len} bytes, header needs {RECORD_HEADER_LEN}")]
    Truncated { len: usize },

    #[error("payload length {declared} does not match {actual} trailing bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown record flags: {0:#x}")]
    UnknownFlags(u32),
}

/// Marker bits carried in the record header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u32);

impl RecordFlags {
    /// No markers
    pub const NONE: RecordFlags = RecordFlags(0);
    /// Last record of a run; acts as an ordering barrier
    pub const END_OF_RUN: RecordFlags = RecordFlags(1 << 0);
    /// Processing failed; the payload carries the error text
    pub const ERROR: RecordFlags = RecordFlags(1 << 1);
    /// Placeholder for an event that was given up on
    pub const GAP: RecordFlags = RecordFlags(1 << 2);

    const ALL: u32 = Self::END_OF_RUN.0 | Self::ERROR.0 | Self::GAP.0;

    /// Validate raw header bits
    pub fn from_bits(bits: u32) -> Result<Self, RecordError> {
        if bits & !Self::ALL != 0 {
            return Err(RecordError::UnknownFlags(bits));
        }
        Ok(RecordFlags(bits))
    }

    /// Raw bit value
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub fn contains(self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bits are set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for RecordFlags {
    type Output = RecordFlags;

    fn bitor(self, rhs: RecordFlags) -> RecordFlags {
        RecordFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RecordFlags {
    fn bitor_assign(&mut self, rhs: RecordFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for RecordFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::END_OF_RUN) {
            names.push("END_OF_RUN");
        }
        if self.contains(Self::ERROR) {
            names.push("ERROR");
        }
        if self.contains(Self::GAP) {
            names.push("GAP");
        }
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Header fields of an encoded record, readable without copying the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Global dispatch sequence number
    pub sequence: u64,
    /// Experiment number
    pub experiment: u32,
    /// Run number
    pub run: u32,
    /// Marker bits
    pub flags: RecordFlags,
    /// Payload length in bytes
    pub payload_len: u32,
}

impl RecordHeader {
    /// Decode just the header of an encoded record
    pub fn peek(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Err(RecordError::Truncated { len: bytes.len() });
        }
        Ok(Self {
            sequence: u64::from_le_bytes(field(bytes, 0)),
            experiment: u32::from_le_bytes(field(bytes, 8)),
            run: u32::from_le_bytes(field(bytes, 12)),
            flags: RecordFlags::from_bits(u32::from_le_bytes(field(bytes, 16)))?,
            payload_len: u32::from_le_bytes(field(bytes, 20)),
        })
    }
}

fn field<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// One unit of work: an opaque payload tagged with its ordering metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Global dispatch sequence number, strictly increasing per run
    pub sequence: u64,
    /// Experiment number
    pub experiment: u32,
    /// Run number
    pub run: u32,
    /// Marker bits
    pub flags: RecordFlags,
    /// Opaque serialized event
    pub payload: Vec<u8>,
}

impl EventRecord {
    /// Plain event record
    pub fn new(sequence: u64, experiment: u32, run: u32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            experiment,
            run,
            flags: RecordFlags::NONE,
            payload,
        }
    }

    /// End-of-run marker with an empty payload
    pub fn end_of_run(sequence: u64, experiment: u32, run: u32) -> Self {
        Self {
            flags: RecordFlags::END_OF_RUN,
            ..Self::new(sequence, experiment, run, Vec::new())
        }
    }

    /// Gap placeholder for an event that will never be delivered
    pub fn gap(sequence: u64, experiment: u32, run: u32) -> Self {
        Self {
            flags: RecordFlags::GAP,
            ..Self::new(sequence, experiment, run, Vec::new())
        }
    }

    /// Failure result carrying `message` as payload
    pub fn error(sequence: u64, experiment: u32, run: u32, message: &str) -> Self {
        Self {
            flags: RecordFlags::ERROR,
            ..Self::new(sequence, experiment, run, message.as_bytes().to_vec())
        }
    }

    /// Whether the record marks the end of a run
    pub fn is_end_of_run(&self) -> bool {
        self.flags.contains(RecordFlags::END_OF_RUN)
    }

    /// Whether the record reports a processing failure
    pub fn is_error(&self) -> bool {
        self.flags.contains(RecordFlags::ERROR)
    }

    /// Whether the record is a gap placeholder
    pub fn is_gap(&self) -> bool {
        self.flags.contains(RecordFlags::GAP)
    }

    /// Header view of this record
    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            sequence: self.sequence,
            experiment: self.experiment,
            run: self.run,
            flags: self.flags,
            payload_len: self.payload.len() as u32,
        }
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload.len()
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Append the encoding to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.experiment.to_le_bytes());
        out.extend_from_slice(&self.run.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Decode a record previously produced by [`EventRecord::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let header = RecordHeader::peek(bytes)?;
        let payload = &bytes[RECORD_HEADER_LEN..];
        if payload.len() != header.payload_len as usize {
            return Err(RecordError::LengthMismatch {
                declared: header.payload_len as usize,
                actual: payload.len(),
            });
        }
        Ok(Self {
            sequence: header.sequence,
            experiment: header.experiment,
            run: header.run,
            flags: header.flags,
            payload: payload.to_vec(),
        })
    }
}
