//! Shared-memory ring buffer
//!
//! A fixed-capacity circular byte queue of length-prefixed records living in a
//! named POSIX shared-memory segment, so independent processes can exchange
//! records by copy.
//!
//! ```text
//! +--------------------------------------------------------------+
//! | RingHeader: magic, capacity, attach count, flags,            |
//! |             robust mutex, data/space semaphores, RingState   |
//! +--------------------------------------------------------------+
//! | arena (capacity bytes)                                        |
//! |   [len u32 LE][payload][pad to 4] [len][payload] ... [SKIP]   |
//! +--------------------------------------------------------------+
//! ```
//!
//! Blocking is semaphore based: `data_available` counts queued records, and
//! `space_available` is posted once per writer that registered itself as
//! waiting, so each pop releases at most one blocked writer. Offset bookkeeping
//! and the payload copy happen under the mutex.
//!
//! If a process dies while holding the mutex the ring is marked poisoned and
//! every handle reports [`RingError::Poisoned`] from then on. The ring must be
//! recreated; there is no in-place repair.

use crate::arena::Arena;
use crate::shm::{self, Origin, ShmSegment};
use crate::sync::{LockState, SharedMutex, SharedSemaphore};
use std::cell::UnsafeCell;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Length value that marks the unused tail of the arena before a wrap
pub const SKIP_MARKER: u32 = u32::MAX;

/// Size of the length prefix in front of every record
const LEN_PREFIX: usize = 4;

/// Smallest arena that can hold a zero-length record
const MIN_CAPACITY: usize = 8;

const RING_MAGIC: u64 = 0x4556_5446_4c4f_5752; // "EVTFLOWR"
const RING_VERSION: u32 = 1;

const FLAG_POISONED: u32 = 1 << 0;
const FLAG_UNLINKED: u32 = 1 << 1;

/// Errors raised by ring buffer operations
#[derive(Debug, Error)]
pub enum RingError {
    #[error("shared memory failure on {name} ({op}): {source}")]
    Resource {
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("ring {name} already exists with {found} bytes (requested {expected} bytes)")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("ring not found: {0}")]
    NotFound(String),

    #[error("ring {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("record of {len} bytes does not fit in a ring of {capacity} bytes")]
    RecordTooLarge { len: usize, capacity: usize },

    #[error("ring {0} is poisoned: a process died while holding its lock")]
    Poisoned(String),

    #[error("invalid ring name: {0:?}")]
    InvalidName(String),

    #[error("invalid ring capacity: {0} bytes (minimum {MIN_CAPACITY})")]
    InvalidCapacity(usize),
}

impl RingError {
    pub(crate) fn resource(name: &str, op: &'static str, source: io::Error) -> Self {
        RingError::Resource {
            name: name.to_string(),
            op,
            source,
        }
    }

    /// Whether the error means the ring itself is unusable and must be recreated
    pub fn requires_recreate(&self) -> bool {
        matches!(self, RingError::Poisoned(_) | RingError::Corrupt { .. })
    }
}

/// Bytes a record of `payload_len` occupies in the arena (prefix + payload, 4-byte aligned)
#[inline]
pub const fn record_footprint(payload_len: usize) -> usize {
    align4(LEN_PREFIX + payload_len)
}

#[inline]
const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Snapshot of a ring's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    /// Arena capacity in bytes
    pub capacity: usize,
    /// Records currently queued
    pub queued: u64,
    /// Arena bytes in use, including wrap padding
    pub used_bytes: u64,
    /// Handles currently attached across all processes
    pub attached: u32,
    /// Records pushed since creation
    pub total_pushed: u64,
    /// Records popped since creation
    pub total_popped: u64,
    /// Highest `used_bytes` observed
    pub high_water: u64,
    /// Writers currently blocked waiting for space
    pub waiting_writers: u64,
    /// Whether the ring has been poisoned
    pub poisoned: bool,
}

/// Offset bookkeeping, only touched while holding the header mutex
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RingState {
    head: u64,
    tail: u64,
    used: u64,
    queued: u64,
    waiting_writers: u64,
    total_pushed: u64,
    total_popped: u64,
    high_water: u64,
}

/// Where a new record goes, and whether the tail must be padded first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    offset: usize,
    skip_at: Option<usize>,
}

impl RingState {
    /// Find room for `need` bytes. An empty ring is compacted back to offset 0.
    fn place(&mut self, need: usize, capacity: usize) -> Option<Placement> {
        if self.queued == 0 {
            self.head = 0;
            self.tail = 0;
            self.used = 0;
            return (need <= capacity).then_some(Placement {
                offset: 0,
                skip_at: None,
            });
        }

        let head = self.head as usize;
        let tail = self.tail as usize;

        if tail > head {
            if capacity - tail >= need {
                Some(Placement {
                    offset: tail,
                    skip_at: None,
                })
            } else if head >= need {
                Some(Placement {
                    offset: 0,
                    skip_at: Some(tail),
                })
            } else {
                None
            }
        } else if tail < head {
            (head - tail >= need).then_some(Placement {
                offset: tail,
                skip_at: None,
            })
        } else {
            // tail == head with records queued: full
            None
        }
    }

    fn commit(&mut self, placement: Placement, need: usize, capacity: usize) {
        if let Some(skip_at) = placement.skip_at {
            self.used += (capacity - skip_at) as u64;
        }
        let tail = placement.offset + need;
        self.tail = if tail == capacity { 0 } else { tail as u64 };
        self.used += need as u64;
        self.queued += 1;
        self.total_pushed += 1;
        self.high_water = self.high_water.max(self.used);
    }

    /// Consume a skip marker at `head` if present, returning the record offset.
    fn skip_padding(&mut self, head_len: u32, capacity: usize) -> Result<usize, String> {
        let head = self.head as usize;
        if head_len != SKIP_MARKER {
            return Ok(head);
        }
        let waste = (capacity - head) as u64;
        self.used = self
            .used
            .checked_sub(waste)
            .ok_or_else(|| format!("skip marker at {} exceeds used bytes {}", head, self.used))?;
        self.head = 0;
        Ok(0)
    }

    fn release(&mut self, offset: usize, footprint: usize, capacity: usize) -> Result<(), String> {
        self.used = self.used.checked_sub(footprint as u64).ok_or_else(|| {
            format!(
                "record of {} bytes at {} exceeds used bytes {}",
                footprint, offset, self.used
            )
        })?;
        let head = offset + footprint;
        self.head = if head == capacity { 0 } else { head as u64 };
        self.queued -= 1;
        self.total_popped += 1;
        if self.queued == 0 {
            self.head = 0;
            self.tail = 0;
            self.used = 0;
        }
        Ok(())
    }
}

/// Layout of the segment prefix. Only ever accessed through a pointer into
/// the mapping.
#[repr(C)]
struct RingHeader {
    magic: AtomicU64,
    version: u32,
    _reserved: u32,
    capacity: u64,
    attached: AtomicU32,
    flags: AtomicU32,
    lock: SharedMutex,
    data_available: SharedSemaphore,
    space_available: SharedSemaphore,
    state: UnsafeCell<RingState>,
}

/// Arena starts on the first cache line after the header
const fn arena_offset() -> usize {
    (std::mem::size_of::<RingHeader>() + 63) & !63
}

#[derive(Debug, Clone, Copy)]
enum Wait {
    Never,
    Forever,
    Until(Instant),
}

impl Wait {
    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Until(deadline) => Some(deadline),
            _ => None,
        }
    }
}

/// A handle to a shared ring buffer.
///
/// Every handle counts as one attachment. Dropping it detaches; the last
/// handle to detach after [`RingBuffer::destroy`] tears down the semaphores
/// and the mutex.
pub struct RingBuffer {
    name: String,
    segment: ShmSegment,
    arena: Arena,
    capacity: usize,
}

// SAFETY: all mutable state lives in shared memory and is protected by the
// process-shared mutex and semaphores in the header.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring with an arena of `capacity_bytes` (rounded up to a multiple of 4).
    ///
    /// A stale segment of identical size under the same name is re-initialized;
    /// one of a different size fails with [`RingError::SizeMismatch`].
    pub fn create(name: &str, capacity_bytes: usize) -> Result<Self, RingError> {
        if capacity_bytes < MIN_CAPACITY {
            return Err(RingError::InvalidCapacity(capacity_bytes));
        }
        let name = shm::normalize_name(name)?;
        let capacity = align4(capacity_bytes);
        let (segment, origin) = ShmSegment::create(&name, arena_offset() + capacity)?;

        if let Origin::Existing = origin {
            // SAFETY: size matched, so the mapping covers a full header
            let attached = unsafe {
                segment
                    .base()
                    .cast::<RingHeader>()
                    .as_ref()
                    .attached
                    .load(Ordering::Acquire)
            };
            warn!(ring = %name, attached, "reclaiming stale ring segment");
        }

        let hdr = segment.base().cast::<RingHeader>().as_ptr();
        // SAFETY: the mapping is at least arena_offset() bytes and page aligned;
        // no other process may use a ring while it is being created.
        unsafe {
            (*hdr).magic.store(0, Ordering::Release);
            std::ptr::addr_of_mut!((*hdr).version).write(RING_VERSION);
            std::ptr::addr_of_mut!((*hdr)._reserved).write(0);
            std::ptr::addr_of_mut!((*hdr).capacity).write(capacity as u64);
            (*hdr).attached.store(1, Ordering::Relaxed);
            (*hdr).flags.store(0, Ordering::Relaxed);
            (*hdr).state.get().write(RingState::default());
            (*hdr)
                .lock
                .init()
                .map_err(|e| RingError::resource(&name, "pthread_mutex_init", e))?;
            (*hdr)
                .data_available
                .init()
                .map_err(|e| RingError::resource(&name, "sem_init", e))?;
            (*hdr)
                .space_available
                .init()
                .map_err(|e| RingError::resource(&name, "sem_init", e))?;
            (*hdr).magic.store(RING_MAGIC, Ordering::Release);
        }

        debug!(ring = %name, capacity, "created ring");
        Ok(Self::from_segment(name, segment, capacity))
    }

    /// Attach to a ring created by another handle or process.
    pub fn attach(name: &str) -> Result<Self, RingError> {
        let name = shm::normalize_name(name)?;
        let segment = ShmSegment::open(&name)?;
        let corrupt = |reason: String| RingError::Corrupt {
            name: name.clone(),
            reason,
        };

        if segment.len() < arena_offset() + MIN_CAPACITY {
            return Err(corrupt(format!("segment too small: {} bytes", segment.len())));
        }

        // SAFETY: length checked above
        let header = unsafe { segment.base().cast::<RingHeader>().as_ref() };
        if header.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(corrupt("bad magic (uninitialized or not a ring)".to_string()));
        }
        if header.version != RING_VERSION {
            return Err(corrupt(format!("unsupported version {}", header.version)));
        }
        let capacity = header.capacity as usize;
        if arena_offset() + capacity != segment.len() {
            return Err(corrupt(format!(
                "header capacity {} does not match segment size {}",
                capacity,
                segment.len()
            )));
        }
        header.attached.fetch_add(1, Ordering::AcqRel);

        debug!(ring = %name, capacity, "attached ring");
        Ok(Self::from_segment(name, segment, capacity))
    }

    fn from_segment(name: String, segment: ShmSegment, capacity: usize) -> Self {
        // SAFETY: the segment spans arena_offset() + capacity bytes and
        // outlives the arena because both are owned by the same RingBuffer
        let arena = unsafe {
            let base = segment.base().add(arena_offset());
            Arena::from_raw(base, capacity)
        };
        Self {
            name,
            segment,
            arena,
            capacity,
        }
    }

    /// Ring name (normalized with a leading `/`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arena capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arena capacity needed to hold `records` payloads of `payload_len` bytes at once
    pub fn capacity_for(records: usize, payload_len: usize) -> usize {
        records * record_footprint(payload_len)
    }

    /// Whether a record of `len` bytes fits at all, even into an empty ring
    pub fn fits(&self, len: usize) -> bool {
        record_footprint(len) <= self.capacity && len < SKIP_MARKER as usize
    }

    /// Append a record, blocking while the ring is full.
    pub fn push(&self, bytes: &[u8]) -> Result<(), RingError> {
        self.push_with(bytes, Wait::Forever).map(|_| ())
    }

    /// Append a record if it fits right now. Returns `false` when full.
    pub fn push_non_blocking(&self, bytes: &[u8]) -> Result<bool, RingError> {
        self.push_with(bytes, Wait::Never)
    }

    /// Append a record, waiting at most `timeout` for space.
    pub fn push_timeout(&self, bytes: &[u8], timeout: Duration) -> Result<bool, RingError> {
        self.push_with(bytes, Wait::Until(Instant::now() + timeout))
    }

    /// Remove the oldest record, blocking while the ring is empty.
    pub fn pop(&self) -> Result<Vec<u8>, RingError> {
        loop {
            if let Some(record) = self.pop_with(Wait::Forever)? {
                return Ok(record);
            }
        }
    }

    /// Remove the oldest record if one is queued.
    pub fn pop_non_blocking(&self) -> Result<Option<Vec<u8>>, RingError> {
        self.pop_with(Wait::Never)
    }

    /// Remove the oldest record, waiting at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, RingError> {
        self.pop_with(Wait::Until(Instant::now() + timeout))
    }

    /// Number of queued records
    pub fn len(&self) -> Result<usize, RingError> {
        let guard = self.lock()?;
        Ok(guard.queued as usize)
    }

    /// Whether no records are queued
    pub fn is_empty(&self) -> Result<bool, RingError> {
        Ok(self.len()? == 0)
    }

    /// Drop every queued record, releasing blocked writers. Returns the number dropped.
    pub fn clear(&self) -> Result<usize, RingError> {
        let mut guard = self.lock()?;
        let dropped = guard.queued as usize;
        while self
            .header()
            .data_available
            .try_wait()
            .map_err(|e| self.os_error("sem_trywait", e))?
        {}
        guard.head = 0;
        guard.tail = 0;
        guard.used = 0;
        guard.queued = 0;
        while guard.waiting_writers > 0 {
            guard.waiting_writers -= 1;
            self.header()
                .space_available
                .post()
                .map_err(|e| self.os_error("sem_post", e))?;
        }
        Ok(dropped)
    }

    /// Counter snapshot. Works on a poisoned ring without taking the lock.
    pub fn stats(&self) -> Result<RingStats, RingError> {
        let header = self.header();
        let poisoned = header.flags.load(Ordering::Acquire) & FLAG_POISONED != 0;
        let state = if poisoned {
            // SAFETY: racy read of plain integers, good enough for diagnostics
            unsafe { header.state.get().read_volatile() }
        } else {
            *self.lock()?
        };
        Ok(RingStats {
            capacity: self.capacity,
            queued: state.queued,
            used_bytes: state.used,
            attached: header.attached.load(Ordering::Acquire),
            total_pushed: state.total_pushed,
            total_popped: state.total_popped,
            high_water: state.high_water,
            waiting_writers: state.waiting_writers,
            poisoned,
        })
    }

    /// Whether a lock holder died and the ring must be recreated
    pub fn is_poisoned(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & FLAG_POISONED != 0
    }

    /// Remove the ring's name so no new handle can attach. The OS resources
    /// are released when the last attached handle is dropped.
    pub fn destroy(self) -> Result<(), RingError> {
        self.header().flags.fetch_or(FLAG_UNLINKED, Ordering::AcqRel);
        shm::unlink(&self.name)?;
        debug!(ring = %self.name, "destroyed ring");
        Ok(())
    }

    /// Destroy this ring and create a fresh one under the same name and capacity.
    pub fn recreate(mut self) -> Result<Self, RingError> {
        self.recreate_in_place()?;
        Ok(self)
    }

    /// Like [`recreate`](Self::recreate), for owners that cannot give up the handle.
    pub fn recreate_in_place(&mut self) -> Result<(), RingError> {
        self.header().flags.fetch_or(FLAG_UNLINKED, Ordering::AcqRel);
        shm::unlink(&self.name)?;
        let fresh = RingBuffer::create(&self.name, self.capacity)?;
        drop(std::mem::replace(self, fresh));
        debug!(ring = %self.name, "recreated ring");
        Ok(())
    }

    /// Attach to `name` if it exists, otherwise create it with `capacity_bytes`.
    pub fn open_or_create(name: &str, capacity_bytes: usize) -> Result<Self, RingError> {
        match RingBuffer::attach(name) {
            Err(RingError::NotFound(_)) => RingBuffer::create(name, capacity_bytes),
            other => other,
        }
    }

    fn push_with(&self, bytes: &[u8], wait: Wait) -> Result<bool, RingError> {
        let need = record_footprint(bytes.len());
        if need > self.capacity || bytes.len() >= SKIP_MARKER as usize {
            return Err(RingError::RecordTooLarge {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }

        loop {
            {
                let mut guard = self.lock()?;
                if let Some(placement) = guard.place(need, self.capacity) {
                    if let Some(skip_at) = placement.skip_at {
                        self.arena.write_u32(skip_at, SKIP_MARKER);
                    }
                    self.arena.write_u32(placement.offset, bytes.len() as u32);
                    self.arena.write(placement.offset + LEN_PREFIX, bytes);
                    guard.commit(placement, need, self.capacity);
                    self.header()
                        .data_available
                        .post()
                        .map_err(|e| self.os_error("sem_post", e))?;
                    return Ok(true);
                }
                if let Wait::Never = wait {
                    return Ok(false);
                }
                guard.waiting_writers += 1;
            }

            let woke = self
                .header()
                .space_available
                .wait(wait.deadline())
                .map_err(|e| self.os_error("sem_wait", e))?;

            if !woke {
                {
                    let mut guard = self.lock()?;
                    if guard.waiting_writers > 0 {
                        guard.waiting_writers -= 1;
                    } else {
                        // A reader already posted on our behalf
                        let _ = self.header().space_available.try_wait();
                    }
                }
                return self.push_with(bytes, Wait::Never);
            }
        }
    }

    fn pop_with(&self, wait: Wait) -> Result<Option<Vec<u8>>, RingError> {
        self.ensure_healthy()?;
        loop {
            let available = match wait {
                Wait::Never => self.header().data_available.try_wait(),
                Wait::Forever | Wait::Until(_) => {
                    self.header().data_available.wait(wait.deadline())
                }
            }
            .map_err(|e| self.os_error("sem_wait", e))?;

            if !available {
                return Ok(None);
            }

            let mut guard = self.lock()?;
            if guard.queued == 0 {
                // Token outlived a clear(); wait again
                continue;
            }

            let head_len = self.arena.read_u32(guard.head as usize);
            let offset = guard
                .skip_padding(head_len, self.capacity)
                .map_err(|reason| self.corrupt(reason))?;
            let len = self.arena.read_u32(offset) as usize;
            let footprint = record_footprint(len);
            if len == SKIP_MARKER as usize || offset + footprint > self.capacity {
                return Err(self.corrupt(format!(
                    "record length {} at offset {} overruns the arena",
                    len, offset
                )));
            }
            let record = self.arena.read(offset + LEN_PREFIX, len);
            guard
                .release(offset, footprint, self.capacity)
                .map_err(|reason| self.corrupt(reason))?;

            if guard.waiting_writers > 0 {
                guard.waiting_writers -= 1;
                self.header()
                    .space_available
                    .post()
                    .map_err(|e| self.os_error("sem_post", e))?;
            }
            return Ok(Some(record));
        }
    }

    fn lock(&self) -> Result<StateGuard<'_>, RingError> {
        self.ensure_healthy()?;
        let header = self.header();
        match header
            .lock
            .lock()
            .map_err(|e| self.os_error("pthread_mutex_lock", e))?
        {
            LockState::Clean => Ok(StateGuard { ring: self }),
            LockState::OwnerDied => {
                header.flags.fetch_or(FLAG_POISONED, Ordering::AcqRel);
                header.lock.unlock();
                warn!(ring = %self.name, "lock holder died mid-update, ring poisoned");
                // Wake one blocked peer on each side so it observes the poison
                let _ = header.data_available.post();
                let _ = header.space_available.post();
                Err(RingError::Poisoned(self.name.clone()))
            }
        }
    }

    fn ensure_healthy(&self) -> Result<(), RingError> {
        if self.is_poisoned() {
            return Err(RingError::Poisoned(self.name.clone()));
        }
        Ok(())
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: the segment always spans a full header (checked on create/attach)
        unsafe { self.segment.base().cast::<RingHeader>().as_ref() }
    }

    fn os_error(&self, op: &'static str, source: io::Error) -> RingError {
        RingError::resource(&self.name, op, source)
    }

    fn corrupt(&self, reason: String) -> RingError {
        RingError::Corrupt {
            name: self.name.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let header = self.header();
        let last = header.attached.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && header.flags.load(Ordering::Acquire) & FLAG_UNLINKED != 0 {
            header.magic.store(0, Ordering::Release);
            // SAFETY: last attached handle of an unlinked ring; nobody can be
            // blocked on these primitives any more
            unsafe {
                header.data_available.destroy();
                header.space_available.destroy();
                header.lock.destroy();
            }
        }
    }
}

/// Holds the ring mutex; unlocks on drop
struct StateGuard<'a> {
    ring: &'a RingBuffer,
}

impl Deref for StateGuard<'_> {
    type Target = RingState;

    fn deref(&self) -> &RingState {
        // SAFETY: the mutex is held for the guard's lifetime
        unsafe { &*self.ring.header().state.get() }
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut RingState {
        // SAFETY: the mutex is held for the guard's lifetime
        unsafe { &mut *self.ring.header().state.get() }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.ring.header().lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/evtflow-ring-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// 12-byte payload: sequence number plus padding, footprint 16 bytes
    fn payload(seq: u64) -> Vec<u8> {
        let mut bytes = seq.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xAB; 4]);
        bytes
    }

    fn seq_of(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[..8].try_into().unwrap())
    }

    #[test]
    fn test_place_compacts_empty_ring() {
        let mut state = RingState {
            head: 40,
            tail: 40,
            used: 0,
            queued: 0,
            ..Default::default()
        };
        let placement = state.place(16, 64).unwrap();
        assert_eq!(placement, Placement { offset: 0, skip_at: None });
        assert_eq!(state.head, 0);
    }

    #[test]
    fn test_place_wraps_with_skip_marker() {
        let mut state = RingState::default();
        for _ in 0..2 {
            let p = state.place(24, 64).unwrap();
            state.commit(p, 24, 64);
        }
        assert_eq!(state.tail, 48);
        state.release(0, 24, 64).unwrap();
        assert_eq!(state.head, 24);

        let p = state.place(24, 64).unwrap();
        assert_eq!(p, Placement { offset: 0, skip_at: Some(48) });
        state.commit(p, 24, 64);
        // 24 live + 16 padding + 24 live
        assert_eq!(state.used, 64);
        assert_eq!(state.tail, 24);
        assert!(state.place(4, 64).is_none());
    }

    #[test]
    fn test_place_full_when_tail_meets_head() {
        let mut state = RingState::default();
        for _ in 0..4 {
            let p = state.place(16, 64).unwrap();
            state.commit(p, 16, 64);
        }
        assert_eq!(state.tail, 0);
        assert_eq!(state.head, 0);
        assert!(state.place(4, 64).is_none());
    }

    #[test]
    fn test_release_detects_inconsistent_used() {
        let mut state = RingState {
            queued: 1,
            used: 8,
            ..Default::default()
        };
        assert!(state.release(0, 16, 64).is_err());
    }

    #[test]
    fn test_fifo_order() {
        let ring = RingBuffer::create(&unique_name("fifo"), 4096).unwrap();
        for seq in 1..=20 {
            ring.push(&payload(seq)).unwrap();
        }
        assert_eq!(ring.len().unwrap(), 20);
        for seq in 1..=20 {
            assert_eq!(seq_of(&ring.pop().unwrap()), seq);
        }
        assert!(ring.is_empty().unwrap());
        ring.destroy().unwrap();
    }

    #[test]
    fn test_eight_record_capacity_scenario() {
        let capacity = RingBuffer::capacity_for(8, 12);
        let ring = RingBuffer::create(&unique_name("cap8"), capacity).unwrap();

        for seq in 1..=8 {
            assert!(ring.push_non_blocking(&payload(seq)).unwrap());
        }
        assert!(!ring.push_non_blocking(&payload(9)).unwrap());

        assert_eq!(seq_of(&ring.pop().unwrap()), 1);
        assert!(ring.push_non_blocking(&payload(9)).unwrap());

        let order: Vec<u64> = (0..8).map(|_| seq_of(&ring.pop().unwrap())).collect();
        assert_eq!(order, vec![2, 3, 4, 5, 6, 7, 8, 9]);
        ring.destroy().unwrap();
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let ring = RingBuffer::create(&unique_name("wrap"), 64).unwrap();
        let a = vec![1u8; 20];
        let b = vec![2u8; 20];
        let c = vec![3u8; 20];

        ring.push(&a).unwrap();
        ring.push(&b).unwrap();
        assert_eq!(ring.pop().unwrap(), a);
        // Needs a skip marker at offset 48 and lands at offset 0
        assert!(ring.push_non_blocking(&c).unwrap());
        assert_eq!(ring.pop().unwrap(), b);
        assert_eq!(ring.pop().unwrap(), c);
        assert!(ring.pop_non_blocking().unwrap().is_none());
        ring.destroy().unwrap();
    }

    #[test]
    fn test_many_wraps_with_mixed_sizes() {
        let ring = RingBuffer::create(&unique_name("mixed"), 256).unwrap();
        let mut expected = std::collections::VecDeque::new();
        for i in 0..500usize {
            let record = vec![(i % 251) as u8; i % 37];
            while !ring.push_non_blocking(&record).unwrap() {
                let front: Vec<u8> = expected.pop_front().unwrap();
                assert_eq!(ring.pop().unwrap(), front);
            }
            expected.push_back(record);
        }
        while let Some(front) = expected.pop_front() {
            assert_eq!(ring.pop().unwrap(), front);
        }
        ring.destroy().unwrap();
    }

    #[test]
    fn test_zero_length_record() {
        let ring = RingBuffer::create(&unique_name("empty"), 64).unwrap();
        ring.push(&[]).unwrap();
        ring.push(b"x").unwrap();
        assert_eq!(ring.pop().unwrap(), Vec::<u8>::new());
        assert_eq!(ring.pop().unwrap(), b"x");
        ring.destroy().unwrap();
    }

    #[test]
    fn test_record_too_large() {
        let ring = RingBuffer::create(&unique_name("large"), 64).unwrap();
        assert!(!ring.fits(61));
        assert!(ring.fits(60));
        let err = ring.push(&[0u8; 61]).unwrap_err();
        assert!(matches!(err, RingError::RecordTooLarge { len: 61, capacity: 64 }));
        // Exactly the capacity fits
        assert!(ring.push_non_blocking(&[0u8; 60]).unwrap());
        ring.destroy().unwrap();
    }

    #[test]
    fn test_invalid_capacity() {
        let err = RingBuffer::create(&unique_name("tiny"), 4).unwrap_err();
        assert!(matches!(err, RingError::InvalidCapacity(4)));
    }

    #[test]
    fn test_capacity_rounded_up() {
        let ring = RingBuffer::create(&unique_name("round"), 61).unwrap();
        assert_eq!(ring.capacity(), 64);
        ring.destroy().unwrap();
    }

    #[test]
    fn test_attach_shares_records() {
        let name = unique_name("attach");
        let producer = RingBuffer::create(&name, 1024).unwrap();
        let consumer = RingBuffer::attach(&name).unwrap();
        assert_eq!(consumer.capacity(), 1024);

        producer.push(b"hello").unwrap();
        assert_eq!(consumer.pop().unwrap(), b"hello");
        assert_eq!(producer.stats().unwrap().attached, 2);

        drop(consumer);
        assert_eq!(producer.stats().unwrap().attached, 1);
        producer.destroy().unwrap();
    }

    #[test]
    fn test_attach_missing_ring() {
        let err = RingBuffer::attach(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, RingError::NotFound(_)));
    }

    #[test]
    fn test_create_size_mismatch() {
        let name = unique_name("mismatch");
        let ring = RingBuffer::create(&name, 1024).unwrap();
        let err = RingBuffer::create(&name, 2048).unwrap_err();
        assert!(matches!(err, RingError::SizeMismatch { .. }));
        ring.destroy().unwrap();
    }

    #[test]
    fn test_destroy_prevents_attach() {
        let name = unique_name("destroy");
        let ring = RingBuffer::create(&name, 128).unwrap();
        let other = RingBuffer::attach(&name).unwrap();
        ring.destroy().unwrap();
        assert!(matches!(
            RingBuffer::attach(&name).unwrap_err(),
            RingError::NotFound(_)
        ));
        // Existing handles keep working until dropped
        other.push(b"still mapped").unwrap();
        assert_eq!(other.pop().unwrap(), b"still mapped");
    }

    #[test]
    fn test_recreate_resets_contents() {
        let name = unique_name("recreate");
        let ring = RingBuffer::create(&name, 128).unwrap();
        ring.push(b"old").unwrap();
        let ring = ring.recreate().unwrap();
        assert_eq!(ring.len().unwrap(), 0);
        assert_eq!(ring.name(), name);
        ring.destroy().unwrap();
    }

    #[test]
    fn test_open_or_create() {
        let name = unique_name("open-or-create");
        let created = RingBuffer::open_or_create(&name, 128).unwrap();
        created.push(b"kept").unwrap();
        let attached = RingBuffer::open_or_create(&name, 4096).unwrap();
        assert_eq!(attached.capacity(), 128);
        assert_eq!(attached.pop().unwrap(), b"kept");
        created.destroy().unwrap();
    }

    #[test]
    fn test_clear_drops_records() {
        let ring = RingBuffer::create(&unique_name("clear"), 256).unwrap();
        for seq in 0..5 {
            ring.push(&payload(seq)).unwrap();
        }
        assert_eq!(ring.clear().unwrap(), 5);
        assert!(ring.pop_non_blocking().unwrap().is_none());
        ring.push(&payload(42)).unwrap();
        assert_eq!(seq_of(&ring.pop().unwrap()), 42);
        ring.destroy().unwrap();
    }

    #[test]
    fn test_pop_timeout_on_empty() {
        let ring = RingBuffer::create(&unique_name("timeout"), 64).unwrap();
        let start = Instant::now();
        assert!(ring.pop_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        ring.destroy().unwrap();
    }

    #[test]
    fn test_push_timeout_on_full() {
        let ring = RingBuffer::create(&unique_name("pushtimeout"), 16).unwrap();
        assert!(ring.push_non_blocking(&payload(1)).unwrap());
        assert!(!ring.push_timeout(&payload(2), Duration::from_millis(30)).unwrap());
        assert_eq!(ring.stats().unwrap().waiting_writers, 0);
        ring.destroy().unwrap();
    }

    #[test]
    fn test_blocking_pop_wakes_on_push() {
        let name = unique_name("wake");
        let ring = RingBuffer::create(&name, 256).unwrap();
        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let ring = RingBuffer::attach(&name).unwrap();
            tx.send(seq_of(&ring.pop().unwrap())).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        ring.push(&payload(7)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        reader.join().unwrap();
        ring.destroy().unwrap();
    }

    #[test]
    fn test_each_pop_releases_one_blocked_writer() {
        let name = unique_name("release");
        let ring = Arc::new(RingBuffer::create(&name, RingBuffer::capacity_for(2, 12)).unwrap());
        ring.push(&payload(1)).unwrap();
        ring.push(&payload(2)).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let writers: Vec<_> = (3..=4)
            .map(|seq| {
                let name = name.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let ring = RingBuffer::attach(&name).unwrap();
                    ring.push(&payload(seq)).unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        ring.pop().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(done.load(Ordering::SeqCst), 1);

        ring.pop().unwrap();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(ring.len().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let name = unique_name("spsc");
        let ring = RingBuffer::create(&name, 512).unwrap();
        let producer = thread::spawn(move || {
            let ring = RingBuffer::attach(&name).unwrap();
            for seq in 0..5_000u64 {
                ring.push(&payload(seq)).unwrap();
            }
        });
        for expected in 0..5_000u64 {
            assert_eq!(seq_of(&ring.pop().unwrap()), expected);
        }
        producer.join().unwrap();
        let stats = ring.stats().unwrap();
        assert_eq!(stats.total_pushed, 5_000);
        assert_eq!(stats.total_popped, 5_000);
        assert!(stats.high_water <= 512);
        ring.destroy().unwrap();
    }

    #[test]
    fn test_lock_holder_death_poisons_ring() {
        let name = unique_name("poison");
        let ring = RingBuffer::create(&name, 128).unwrap();

        // SAFETY: the child only locks the mutex and exits
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            let _ = ring.header().lock.lock();
            unsafe { libc::_exit(0) };
        }
        let mut status = 0;
        unsafe { libc::waitpid(pid, &mut status, 0) };

        let err = ring.push(b"after death").unwrap_err();
        assert!(matches!(err, RingError::Poisoned(_)));
        assert!(err.requires_recreate());
        assert!(ring.is_poisoned());
        assert!(ring.stats().unwrap().poisoned);
        assert!(matches!(
            ring.pop_non_blocking().unwrap_err(),
            RingError::Poisoned(_)
        ));

        let ring = ring.recreate().unwrap();
        ring.push(b"fresh").unwrap();
        assert_eq!(ring.pop().unwrap(), b"fresh");
        ring.destroy().unwrap();
    }
}
