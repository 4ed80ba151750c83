//! A segment provider backed by an anonymous memory mapping.

use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::segment::{round_up, SegmentProvider};

/// `MmapSegment` reserves one fixed range of address space up front and moves
/// a break through it, so that growth is always contiguous.
///
/// Pages are only backed by physical memory once they are touched; pages
/// given back with [`shrink`](#method.shrink) are released with
/// `madvise(MADV_DONTNEED)`. The whole range is unmapped on drop.
pub struct MmapSegment {
    base: NonNull<u8>,
    capacity: usize,
    len: usize,
    page_size: usize,
}

// The mapping is owned by this value alone.
unsafe impl Send for MmapSegment {}

#[derive(Debug)]
pub enum MmapError {
    /// The OS refused a call.
    Os(Errno),
    /// The break would leave the reserved range.
    Exhausted { requested: usize, available: usize },
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmapError::Os(errno) => write!(f, "mmap segment: {}", errno),
            MmapError::Exhausted {
                requested,
                available,
            } => write!(
                f,
                "mmap segment: cannot move the break by {} bytes ({} available)",
                requested, available
            ),
        }
    }
}

impl MmapSegment {
    /// Reserve `capacity` bytes of address space, rounded up to whole pages.
    pub fn reserve(capacity: usize) -> Result<MmapSegment, MmapError> {
        let page_size = sysconf::page::pagesize();
        let capacity = round_up(capacity, page_size).ok_or(MmapError::Exhausted {
            requested: capacity,
            available: 0,
        })?;

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                capacity,
                libc::PROT_WRITE | libc::PROT_READ,
                // Private, and not backed by any file.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MmapError::Os(errno::errno()));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(MmapError::Os(errno::errno()))?;

        Ok(MmapSegment {
            base,
            capacity,
            len: 0,
            page_size,
        })
    }

    /// Size of the reserved range.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently below the break.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl SegmentProvider for MmapSegment {
    type Err = MmapError;

    fn bounds(&self) -> (*mut u8, *mut u8) {
        let start = self.base.as_ptr();
        (start, start.wrapping_add(self.len))
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn grow(&mut self, size: usize) -> Result<*mut u8, MmapError> {
        let available = self.capacity - self.len;
        let growing = round_up(size, self.page_size).unwrap_or(usize::MAX);
        if growing > available {
            return Err(MmapError::Exhausted {
                requested: growing,
                available,
            });
        }

        let old = self.base.as_ptr().add(self.len);
        self.len += growing;
        Ok(old)
    }

    unsafe fn shrink(&mut self, size: usize) -> Result<(), MmapError> {
        if size > self.len {
            return Err(MmapError::Exhausted {
                requested: size,
                available: self.len,
            });
        }

        let new_len = self.len - size;
        // Only pages lying wholly above the new break can be dropped.
        // new_len is below the reserved capacity, so this cannot overflow.
        let first_page = round_up(new_len, self.page_size).unwrap_or(self.len);
        if first_page < self.len {
            let rc = libc::madvise(
                self.base.as_ptr().add(first_page) as *mut libc::c_void,
                self.len - first_page,
                libc::MADV_DONTNEED,
            );
            if rc != 0 {
                return Err(MmapError::Os(errno::errno()));
            }
        }

        self.len = new_len;
        Ok(())
    }
}

impl Drop for MmapSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}
