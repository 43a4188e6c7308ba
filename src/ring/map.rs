//! Platform construction of the double virtual mapping.
//!
//! The ring reserves `2 * size` bytes of contiguous address space, then
//! replaces both halves in place with shared views of one swap-backed
//! object, so offset `size + i` aliases offset `i`. Failure at any step
//! releases everything acquired before it.

use std::io::Error;
use std::ptr::{self, NonNull};

use crate::error::CxError;

/// Granularity every ring size must be a multiple of.
pub(super) fn allocation_granularity() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn backing_fd() -> std::io::Result<libc::c_int> {
    const NAME: &[u8] = b"cxcapture-ring\0";
    // SAFETY: NAME is a valid NUL-terminated string.
    let fd = unsafe { libc::memfd_create(NAME.as_ptr().cast(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(fd)
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn backing_fd() -> std::io::Result<libc::c_int> {
    // No memfd on this platform; an unlinked temporary file is the
    // closest anonymous shared object.
    let mut template = *b"/tmp/cxcapture-ring-XXXXXX\0";
    // SAFETY: template is a writable NUL-terminated buffer.
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    // SAFETY: template now holds the path mkstemp produced.
    unsafe { libc::unlink(template.as_ptr().cast()) };
    Ok(fd)
}

/// Maps two adjacent read-write views of the same `size`-byte backing
/// object and returns the base of the combined `2 * size` range.
pub(super) fn map_ring(size: usize) -> Result<NonNull<u8>, CxError> {
    if size == 0 || size % allocation_granularity() != 0 {
        return Err(CxError::RingSizeAlignment(size));
    }

    let fd = backing_fd().map_err(CxError::RingBackingCreate)?;

    // SAFETY: fd is a fresh descriptor owned by this function.
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
        let err = Error::last_os_error();
        // SAFETY: fd is still open.
        unsafe { libc::close(fd) };
        return Err(CxError::RingBackingSize(err));
    }

    // SAFETY: fresh anonymous reservation; no existing mapping is touched.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size * 2,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let err = Error::last_os_error();
        // SAFETY: fd is still open.
        unsafe { libc::close(fd) };
        return Err(CxError::RingReserve(err));
    }
    let base = base.cast::<u8>();

    // SAFETY: replaces the lower half of the reservation in place.
    let lo = unsafe {
        libc::mmap(
            base.cast(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if lo == libc::MAP_FAILED {
        let err = Error::last_os_error();
        // SAFETY: releasing the resources acquired above.
        unsafe {
            libc::munmap(base.cast(), size * 2);
            libc::close(fd);
        }
        return Err(CxError::RingMapLow(err));
    }

    // SAFETY: replaces the upper half of the reservation in place.
    let hi = unsafe {
        libc::mmap(
            base.add(size).cast(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        )
    };
    if hi == libc::MAP_FAILED {
        let err = Error::last_os_error();
        // SAFETY: releasing the resources acquired above.
        unsafe {
            libc::munmap(base.cast(), size * 2);
            libc::close(fd);
        }
        return Err(CxError::RingMapHigh(err));
    }

    // Both views hold their own reference to the backing object.
    // SAFETY: fd is still open.
    unsafe { libc::close(fd) };

    NonNull::new(base).ok_or_else(|| CxError::RingReserve(Error::other("null mapping")))
}

/// Unmaps a ring created by [`map_ring`].
///
/// # Safety
/// `base` must come from `map_ring(size)` and must not be used afterwards.
pub(super) unsafe fn unmap_ring(base: NonNull<u8>, size: usize) {
    libc::munmap(base.as_ptr().cast(), size * 2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_size() {
        let err = map_ring(1000).unwrap_err();
        assert_eq!(err.ring_step(), Some(1));
    }

    #[test]
    fn views_alias_the_same_pages() {
        let size = allocation_granularity();
        let base = map_ring(size).unwrap();
        unsafe {
            // Mutate through the lower view, observe through the upper.
            base.as_ptr().write(0xA5);
            assert_eq!(base.as_ptr().add(size).read(), 0xA5);

            // And the other way around.
            base.as_ptr().add(size + 1).write(0x5A);
            assert_eq!(base.as_ptr().add(1).read(), 0x5A);

            unmap_ring(base, size);
        }
    }
}
