//! The boundary between the heap and whatever hands it raw memory.
//!
//! ## [`SegmentProvider`](trait.SegmentProvider.html)
//!
//! A provider owns one contiguous segment of memory with a movable break,
//! much like the classic data segment: it reports where the segment starts,
//! where the break is, and its page size, and it can move the break up or
//! down.
//!
//! ## [`Segment`](struct.Segment.html)
//!
//! The heap never calls a provider directly. `Segment` wraps it, makes sure
//! growth is really contiguous, and keeps count of the traffic.
//!
//! ## [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a borrowed byte buffer that can pretend to be a segment. It is
//! mainly useful for testing.

use core::fmt;
use core::marker::PhantomData;

// Round up value to the nearest multiple of increment, or None if that
// multiple does not fit in a usize.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    value.checked_add(increment - 1).map(|v| v / increment * increment)
}

pub trait SegmentProvider {
    type Err: fmt::Debug;

    /// The start of the segment and its current break.
    fn bounds(&self) -> (*mut u8, *mut u8);

    /// The granularity the provider works in.
    fn page_size(&self) -> usize;

    /// Move the break up by at least `size` bytes, returning the previous
    /// break. The new memory runs from there up to the new break.
    ///
    /// # Safety
    ///
    /// Memory below the old break is untouched, but anything handed out
    /// between the two breaks must be unused by other code.
    unsafe fn grow(&mut self, size: usize) -> Result<*mut u8, Self::Err>;

    /// Move the break down by `size` bytes, a multiple of the page size.
    ///
    /// # Safety
    ///
    /// Nothing may still be using the memory above the new break.
    unsafe fn shrink(&mut self, size: usize) -> Result<(), Self::Err>;
}

/// The heap's handle on its provider.
pub struct Segment<P> {
    provider: P,
    growths: usize,
    shrinks: usize,
}

impl<P: SegmentProvider> Segment<P> {
    pub fn new(provider: P) -> Self {
        Segment {
            provider,
            growths: 0,
            shrinks: 0,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn start(&self) -> *mut u8 {
        self.provider.bounds().0
    }

    pub fn brk(&self) -> *mut u8 {
        self.provider.bounds().1
    }

    pub fn page_size(&self) -> usize {
        self.provider.page_size()
    }

    /// Number of successful grow calls, including the initial chunk.
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Number of successful shrink calls.
    pub fn shrinks(&self) -> usize {
        self.shrinks
    }

    /// Grow the segment by at least `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the provider hands out memory anywhere but at the old break.
    pub(crate) fn grow(&mut self, size: usize) -> Result<*mut u8, P::Err> {
        let brk = self.brk();
        let old = unsafe { self.provider.grow(size)? };
        if old != brk {
            panic!(
                "segment provider grew at {:p}, but the break was at {:p}",
                old, brk
            );
        }
        self.growths += 1;
        Ok(old)
    }

    pub(crate) fn shrink(&mut self, size: usize) -> Result<(), P::Err> {
        unsafe { self.provider.shrink(size)? };
        self.shrinks += 1;
        Ok(())
    }
}

/// A fake segment over a borrowed buffer.
pub struct ToyHeap<'a> {
    base: *mut u8,
    capacity: usize,
    pub page_size: usize,
    pub size: usize,
    _buf: PhantomData<&'a mut [u8]>,
}

impl<'a> ToyHeap<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        ToyHeap {
            base: buf.as_mut_ptr(),
            capacity: buf.len(),
            page_size: 64,
            size: 0,
            _buf: PhantomData,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// The buffer is exclusively borrowed for 'a, so the toy heap may move across
// threads like the borrow itself.
unsafe impl Send for ToyHeap<'_> {}

#[derive(Debug, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy heap cannot move its break by {} bytes ({} available)",
            self.requested, self.available
        )
    }
}

impl SegmentProvider for ToyHeap<'_> {
    type Err = ToyHeapOverflowError;

    fn bounds(&self) -> (*mut u8, *mut u8) {
        (self.base, self.base.wrapping_add(self.size))
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn grow(&mut self, size: usize) -> Result<*mut u8, Self::Err> {
        let available = self.capacity - self.size;
        let allocating = match round_up(size, self.page_size) {
            Some(allocating) if allocating <= available => allocating,
            Some(allocating) => {
                return Err(ToyHeapOverflowError {
                    requested: allocating,
                    available,
                })
            }
            None => {
                return Err(ToyHeapOverflowError {
                    requested: size,
                    available,
                })
            }
        };

        let ptr = self.base.add(self.size);
        self.size += allocating;
        Ok(ptr)
    }

    unsafe fn shrink(&mut self, size: usize) -> Result<(), Self::Err> {
        if size > self.size {
            return Err(ToyHeapOverflowError {
                requested: size,
                available: self.size,
            });
        }
        self.size -= size;
        Ok(())
    }
}
