//! Bounds-checked view over the payload area of a mapped segment.
//!
//! The raw mapping pointer is wrapped once when a ring is created or attached;
//! every byte that moves in or out of the arena goes through [`Arena::read`]
//! and [`Arena::write`].

use std::ptr::NonNull;

/// A fixed-length byte region inside shared memory.
///
/// `Arena` does no synchronization of its own. Callers serialize access
/// through the ring's mutex.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
}

impl Arena {
    /// Wrap a raw region.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `len` bytes that stay mapped and writable
    /// for the lifetime of the returned `Arena`.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Length of the arena in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena has zero length
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `len` bytes starting at `offset` out of the arena.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len` exceeds the arena length.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.check(offset, len);
        let mut out = vec![0u8; len];
        // SAFETY: range checked above, `out` does not alias shared memory
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    /// Copy `bytes` into the arena at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + bytes.len()` exceeds the arena length.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        self.check(offset, bytes.len());
        // SAFETY: range checked above, `bytes` does not alias shared memory
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Read a little-endian `u32` at `offset`
    pub fn read_u32(&self, offset: usize) -> u32 {
        let bytes = self.read(offset, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Write a little-endian `u32` at `offset`
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len),
            "arena access out of bounds: offset {} + len {} > capacity {}",
            offset,
            len,
            self.len
        );
    }
}
