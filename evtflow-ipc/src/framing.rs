//! Length-prefixed framing
//!
//! One frame format serves two streams:
//! - the control pipe between supervisor and worker, carrying rkyv messages
//! - record files written by `evtflow feed`/`evtflow drain`, carrying encoded
//!   [`EventRecord`](crate::EventRecord)s
//!
//! ```text
//! +----------------+------------------+
//! | length (4 LE)  | body             |
//! +----------------+------------------+
//! ```

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

/// Largest frame body accepted on either stream (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors raised while writing or reading frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("end of stream")]
    EndOfStream,
}

/// Write one raw frame and flush.
pub fn write_raw_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one raw frame. A clean end of input before the length prefix yields
/// [`FrameError::EndOfStream`]; one inside a frame is an I/O error.
pub fn read_raw_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = read_len(reader)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

fn read_len<R: Read>(reader: &mut R) -> Result<usize, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::EndOfStream),
        Err(e) => return Err(FrameError::Io(e)),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

/// Buffered writer of rkyv control messages
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a writer (typically the control pipe)
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(8 * 1024, writer),
        }
    }

    /// Serialize `message` and write it as one frame
    pub fn write<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        let bytes = rkyv::to_bytes::<_, 256>(message)
            .map_err(|e| FrameError::Serialization(e.to_string()))?;
        write_raw_frame(&mut self.writer, &bytes)
    }

    /// Consume and return the inner writer
    pub fn into_inner(self) -> BufWriter<W> {
        self.writer
    }
}

/// Buffered reader of rkyv control messages
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a reader (typically the control pipe)
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(8 * 1024, reader),
        }
    }

    /// Read and validate one message
    pub fn read<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        let len = read_len(&mut self.reader)?;
        if len == 0 {
            return Err(FrameError::InvalidFrame("zero-length message".to_string()));
        }

        let mut buf = rkyv::AlignedVec::with_capacity(len);
        buf.resize(len, 0);
        self.reader.read_exact(&mut buf)?;

        let archived = rkyv::check_archived_root::<T>(&buf)
            .map_err(|e| FrameError::Deserialization(e.to_string()))?;
        archived
            .deserialize(&mut Infallible)
            .map_err(|_| FrameError::Deserialization("infallible deserializer failed".to_string()))
    }

    /// Whether a complete or partial frame is already buffered in memory,
    /// in which case polling the descriptor would under-report readiness
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }
}

/// Result of [`wait_for_data`]
#[derive(Debug)]
pub enum PollResult {
    /// Readable (possibly with the peer already gone)
    DataAvailable,
    /// Nothing arrived before the timeout
    Timeout,
    /// Peer closed its end and nothing is left to read
    PipeClosed,
    /// `poll` itself failed
    Error(std::io::Error),
}

/// Wait until `fd` is readable or `timeout` passes.
pub fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return PollResult::Timeout;
        }
        PollResult::Error(err)
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Drain pending data before reporting a hang-up
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rkyv::{Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
    use std::io::Cursor;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    #[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
    #[archive(check_bytes)]
    struct Probe {
        id: u32,
        label: String,
    }

    #[test]
    fn test_messages_in_order() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            for id in 0..3 {
                writer
                    .write(&Probe {
                        id,
                        label: format!("probe-{}", id),
                    })
                    .unwrap();
            }
        }

        let mut reader = FrameReader::new(Cursor::new(buffer));
        for id in 0..3 {
            let probe: Probe = reader.read().unwrap();
            assert_eq!(probe.id, id);
            assert_eq!(probe.label, format!("probe-{}", id));
        }
        assert!(matches!(reader.read::<Probe>(), Err(FrameError::EndOfStream)));
    }

    #[test]
    fn test_raw_frames() {
        let mut buffer = Vec::new();
        write_raw_frame(&mut buffer, b"first").unwrap();
        write_raw_frame(&mut buffer, b"").unwrap();
        write_raw_frame(&mut buffer, b"third").unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_raw_frame(&mut cursor).unwrap(), b"first");
        assert_eq!(read_raw_frame(&mut cursor).unwrap(), b"");
        assert_eq!(read_raw_frame(&mut cursor).unwrap(), b"third");
        assert!(matches!(
            read_raw_frame(&mut cursor),
            Err(FrameError::EndOfStream)
        ));
    }

    #[test]
    fn test_truncated_body_is_io_error() {
        let mut buffer = Vec::new();
        write_raw_frame(&mut buffer, b"abcdef").unwrap();
        buffer.truncate(7);
        assert!(matches!(
            read_raw_frame(&mut Cursor::new(buffer)),
            Err(FrameError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let bytes = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes().to_vec();
        assert!(matches!(
            read_raw_frame(&mut Cursor::new(bytes)),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_zero_length_message_rejected() {
        let mut reader = FrameReader::new(Cursor::new(0u32.to_le_bytes().to_vec()));
        assert!(matches!(
            reader.read::<Probe>(),
            Err(FrameError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_wait_for_data_on_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        assert!(matches!(
            wait_for_data(read_end.as_raw_fd(), Duration::from_millis(10)),
            PollResult::Timeout
        ));

        let mut file = std::fs::File::from(write_end);
        file.write_all(b"x").unwrap();
        assert!(matches!(
            wait_for_data(read_end.as_raw_fd(), Duration::from_millis(10)),
            PollResult::DataAvailable
        ));

        drop(file);
        let mut byte = [0u8; 1];
        std::fs::File::from(read_end.try_clone().unwrap())
            .read_exact(&mut byte)
            .unwrap();
        assert!(matches!(
            wait_for_data(read_end.as_raw_fd(), Duration::from_millis(10)),
            PollResult::PipeClosed
        ));
    }
}
