//! Named POSIX shared-memory segments (`shm_open` + `mmap`).

use crate::ring_buffer::RingError;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// Longest name accepted by `shm_open` on Linux, including the leading slash
const MAX_NAME_LEN: usize = 255;

/// A mapped shared-memory segment. Unmapped on drop; the name is only
/// removed by [`unlink`].
pub(crate) struct ShmSegment {
    _fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the segment is a plain memory mapping; all concurrent access to its
// contents is synchronized by the primitives stored inside it.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

/// Whether [`ShmSegment::create`] made a new segment or found one
pub(crate) enum Origin {
    Created,
    Existing,
}

impl ShmSegment {
    /// Create a segment of exactly `len` bytes, or open an existing one of the
    /// same size. An existing segment of a different size is an error.
    pub(crate) fn create(name: &str, len: usize) -> Result<(Self, Origin), RingError> {
        let cname = c_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };

        if fd >= 0 {
            // SAFETY: fd was just returned by shm_open
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                let _ = unlink(name);
                return Err(RingError::resource(name, "ftruncate", err));
            }
            let segment = Self::map(name, fd, len)?;
            return Ok((segment, Origin::Created));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(RingError::resource(name, "shm_open", err));
        }

        let fd = open_existing(name, &cname)?;
        let found = segment_size(name, &fd)?;
        if found != len {
            return Err(RingError::SizeMismatch {
                name: name.to_string(),
                expected: len,
                found,
            });
        }
        let segment = Self::map(name, fd, len)?;
        Ok((segment, Origin::Existing))
    }

    /// Open an existing segment and map all of it.
    pub(crate) fn open(name: &str) -> Result<Self, RingError> {
        let cname = c_name(name)?;
        let fd = open_existing(name, &cname)?;
        let len = segment_size(name, &fd)?;
        if len == 0 {
            return Err(RingError::Corrupt {
                name: name.to_string(),
                reason: "segment has zero length".to_string(),
            });
        }
        Self::map(name, fd, len)
    }

    fn map(name: &str, fd: OwnedFd, len: usize) -> Result<Self, RingError> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(RingError::resource(
                name,
                "mmap",
                io::Error::last_os_error(),
            ));
        }
        let base = NonNull::new(addr as *mut u8).ok_or_else(|| {
            RingError::resource(name, "mmap", io::Error::other("null mapping"))
        })?;
        Ok(Self { _fd: fd, base, len })
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Remove a segment name. Existing mappings stay valid until unmapped.
pub(crate) fn unlink(name: &str) -> Result<(), RingError> {
    let cname = c_name(name)?;
    if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(RingError::resource(name, "shm_unlink", err));
        }
    }
    Ok(())
}

/// Normalize a user-facing ring name into a POSIX shm name (`/name`).
pub(crate) fn normalize_name(name: &str) -> Result<String, RingError> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\0') {
        return Err(RingError::InvalidName(name.to_string()));
    }
    let normalized = format!("/{}", trimmed);
    if normalized.len() > MAX_NAME_LEN {
        return Err(RingError::InvalidName(name.to_string()));
    }
    Ok(normalized)
}

fn c_name(name: &str) -> Result<CString, RingError> {
    CString::new(name).map_err(|_| RingError::InvalidName(name.to_string()))
}

fn open_existing(name: &str, cname: &CString) -> Result<OwnedFd, RingError> {
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Err(RingError::NotFound(name.to_string()));
        }
        return Err(RingError::resource(name, "shm_open", err));
    }
    // SAFETY: fd was just returned by shm_open
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn segment_size(name: &str, fd: &OwnedFd) -> Result<usize, RingError> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
        return Err(RingError::resource(
            name,
            "fstat",
            io::Error::last_os_error(),
        ));
    }
    Ok(st.st_size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("events").unwrap(), "/events");
        assert_eq!(normalize_name("/events").unwrap(), "/events");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("/").is_err());
        assert!(normalize_name("a/b").is_err());
        assert!(normalize_name(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_create_open_and_size_mismatch() {
        let name = format!("/evtflow-shm-test-{}", std::process::id());
        let (segment, origin) = ShmSegment::create(&name, 4096).unwrap();
        assert!(matches!(origin, Origin::Created));
        assert_eq!(segment.len(), 4096);

        let opened = ShmSegment::open(&name).unwrap();
        assert_eq!(opened.len(), 4096);

        let (_again, origin) = ShmSegment::create(&name, 4096).unwrap();
        assert!(matches!(origin, Origin::Existing));

        let err = ShmSegment::create(&name, 8192).err().unwrap();
        assert!(matches!(err, RingError::SizeMismatch { found: 4096, .. }));

        unlink(&name).unwrap();
        assert!(matches!(
            ShmSegment::open(&name).err().unwrap(),
            RingError::NotFound(_)
        ));
    }
}
