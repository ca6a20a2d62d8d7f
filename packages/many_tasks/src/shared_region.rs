//! Memory that stays shared with worker processes forked after it was created.

use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::slice;

use crate::PoolError;

/// A fixed-length array of `T` in memory that is shared with child processes.
///
/// On unix this is an anonymous `MAP_SHARED` mapping: a worker process forked after the region
/// was created sees the same physical memory as its parent, so atomic operations on the elements
/// are visible across processes. On other platforms the region is ordinary heap memory, which is
/// only shared between threads.
///
/// Elements are only ever accessed by shared reference, so `T` must provide its own interior
/// synchronization (atomics). Elements are never dropped.
pub(crate) struct SharedRegion<T> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: The region only hands out shared references to `T` and `T: Sync` guarantees that
// concurrent access through them is sound. Ownership of the mapping itself can move freely.
unsafe impl<T: Sync> Send for SharedRegion<T> {}
// SAFETY: See above.
unsafe impl<T: Sync> Sync for SharedRegion<T> {}

impl<T> fmt::Debug for SharedRegion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl<T: Sync> SharedRegion<T> {
    /// Maps a new region of `len` elements, initializing each with `init(index)`.
    pub(crate) fn new(len: usize, mut init: impl FnMut(usize) -> T) -> Result<Self, PoolError> {
        const {
            assert!(!mem::needs_drop::<T>(), "shared region elements are never dropped");
            assert!(mem::size_of::<T>() != 0, "shared region elements must have a size");
        };

        if len == 0 {
            return Err(PoolError::invalid_configuration(
                "a shared region must hold at least one element",
            ));
        }

        let ptr = pal::allocate::<T>(len)?;

        for index in 0..len {
            // SAFETY: The allocation holds `len` properly aligned elements and `index < len`.
            // Nothing else can observe the memory yet.
            unsafe {
                ptr.add(index).write(init(index));
            }
        }

        Ok(Self { ptr, len })
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: All `len` elements were initialized in `new()` and stay valid until `drop()`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for SharedRegion<T> {
    #[cfg_attr(test, mutants::skip)] // Impractical to observe an unmapped region.
    fn drop(&mut self) {
        // SAFETY: The pointer and length come from `pal::allocate()` and are released once.
        unsafe {
            pal::release(self.ptr, self.len);
        }
    }
}

#[cfg(unix)]
mod pal {
    use std::io;
    use std::mem;
    use std::ptr::{self, NonNull};

    use crate::PoolError;

    fn byte_len<T>(len: usize) -> Result<usize, PoolError> {
        mem::size_of::<T>()
            .checked_mul(len)
            .ok_or_else(|| PoolError::invalid_configuration("shared region is too large"))
    }

    pub(super) fn allocate<T>(len: usize) -> Result<NonNull<T>, PoolError> {
        let bytes = byte_len::<T>(len)?;

        // SAFETY: Anonymous mapping without a file descriptor, no preconditions beyond valid
        // flags. Mappings are page-aligned, which satisfies the alignment of any `T` we use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(PoolError::SharedMemory {
                source: io::Error::last_os_error(),
            });
        }

        NonNull::new(ptr.cast::<T>()).ok_or_else(|| PoolError::SharedMemory {
            source: io::Error::other("mmap returned a null mapping"),
        })
    }

    /// # Safety
    ///
    /// `ptr` and `len` must come from a previous `allocate::<T>()` call and must not be used
    /// after this call.
    pub(super) unsafe fn release<T>(ptr: NonNull<T>, len: usize) {
        let Ok(bytes) = byte_len::<T>(len) else {
            return;
        };

        // SAFETY: Forwarding the caller's guarantee. A failing munmap only leaks the mapping.
        unsafe {
            libc::munmap(ptr.as_ptr().cast(), bytes);
        }
    }
}

#[cfg(not(unix))]
mod pal {
    use std::alloc::{self, Layout};
    use std::ptr::NonNull;

    use crate::PoolError;

    fn layout<T>(len: usize) -> Result<Layout, PoolError> {
        Layout::array::<T>(len)
            .map_err(|_| PoolError::invalid_configuration("shared region is too large"))
    }

    pub(super) fn allocate<T>(len: usize) -> Result<NonNull<T>, PoolError> {
        let layout = layout::<T>(len)?;

        // SAFETY: The layout has a non-zero size because `len > 0` and `T` is not zero-sized.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr.cast::<T>()).ok_or_else(|| PoolError::SharedMemory {
            source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        })
    }

    /// # Safety
    ///
    /// `ptr` and `len` must come from a previous `allocate::<T>()` call and must not be used
    /// after this call.
    pub(super) unsafe fn release<T>(ptr: NonNull<T>, len: usize) {
        let Ok(layout) = layout::<T>(len) else {
            return;
        };

        // SAFETY: Forwarding the caller's guarantee; same layout as the allocation.
        unsafe {
            alloc::dealloc(ptr.as_ptr().cast(), layout);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[cfg_attr(miri, ignore)] // Miri does not support mmap.
    #[test]
    fn elements_are_initialized() {
        let region = SharedRegion::new(5, |i| AtomicU64::new(i as u64 * 10)).unwrap();

        let values = region
            .as_slice()
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect::<Vec<_>>();

        assert_eq!(values, vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn empty_region_is_rejected() {
        assert!(matches!(
            SharedRegion::new(0, |_| AtomicU64::new(0)),
            Err(PoolError::InvalidConfiguration { .. })
        ));
    }

    #[cfg_attr(miri, ignore)] // Miri does not support mmap.
    #[test]
    fn writes_are_visible_through_shared_references() {
        let region = SharedRegion::new(2, |_| AtomicU64::new(0)).unwrap();

        region.as_slice()[1].fetch_add(3, Ordering::Relaxed);

        assert_eq!(region.as_slice()[1].load(Ordering::Relaxed), 3);
        assert_eq!(region.as_slice()[0].load(Ordering::Relaxed), 0);
    }
}
