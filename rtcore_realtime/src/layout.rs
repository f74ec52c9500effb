//! Layout contract for data placed inside shared memory.
//!
//! A segment is mapped at a different address in every process, so anything stored in it must
//! be a flat record: fixed size, no pointers, no references, no heap handles. Structures that
//! reference each other do so through byte offsets from the segment base, resolved locally
//! after mapping. [`SegmentLayout`] computes such offsets.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize};
use rtcore::consts::CACHE_LINE_SIZE;
use rtcore::error::{RtError, RtResult};
use rtcore::string::BoundedString;
use static_assertions::const_assert_eq;

/// Types that may live inside a shared memory segment.
///
/// # Safety
///
/// Implementors must guarantee that the type:
/// - contains no pointers, references or handles to process-local resources,
/// - has a fixed size and a `#[repr(C)]` (or primitive) layout,
/// - is a valid value when every byte is zero, so it can be used directly in a freshly created
///   segment.
///
/// `ShmSafe` says nothing about shared access: plain records such as integers or
/// [`BoundedString`] are only copied in and out of a segment as bytes. Types that may be
/// referenced in place also implement [`ShmShared`].
pub unsafe trait ShmSafe: Sized {}

/// [`ShmSafe`] records that stay sound while other threads and processes mutate them through
/// their own mappings.
///
/// [`SharedMemorySegment::place`](crate::segment::SharedMemorySegment::place) hands out `&T`
/// only for these types.
///
/// # Safety
///
/// Every byte of the type must live inside an `UnsafeCell` (atomics, process-shared locks,
/// queue slots), and every mutation reachable through `&self` must be synchronized so that
/// concurrent use from several mappings is free of data races.
pub unsafe trait ShmShared: ShmSafe {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ShmSafe for $t {})*
    };
}

impl_shm_safe!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
);

macro_rules! impl_shm_shared {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmSafe for $t {}
            unsafe impl ShmShared for $t {}
        )*
    };
}

impl_shm_shared!(AtomicU8, AtomicU32, AtomicI32, AtomicU64, AtomicI64, AtomicUsize);

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
unsafe impl<T: ShmShared, const N: usize> ShmShared for [T; N] {}
unsafe impl<const N: usize> ShmSafe for BoundedString<N> {}
unsafe impl<T: ShmSafe> ShmSafe for CachePadded<T> {}
unsafe impl<T: ShmShared> ShmShared for CachePadded<T> {}

/// Value aligned to, and padded out to, a cache line.
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

const_assert_eq!(core::mem::align_of::<CachePadded<u8>>(), CACHE_LINE_SIZE);

impl<T> CachePadded<T> {
    /// Wrap a value.
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Size rounded up to a whole number of cache lines.
#[inline]
pub const fn cache_aligned_size(size: usize) -> usize {
    align_up(size, CACHE_LINE_SIZE)
}

/// Offset allocator for laying out several records in one segment.
///
/// Every producing process computes the same sequence of `add` calls and so arrives at the
/// same offsets; only the offsets are shared, never addresses.
///
/// ```
/// use rtcore_realtime::layout::SegmentLayout;
/// use std::sync::atomic::AtomicU64;
///
/// let mut layout = SegmentLayout::new();
/// let counter = layout.add::<AtomicU64>().unwrap();
/// let samples = layout.add::<[u32; 16]>().unwrap();
/// assert_eq!(counter, 0);
/// assert_eq!(samples, 64);
/// assert_eq!(layout.finish(), 128);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentLayout {
    offset: usize,
}

impl SegmentLayout {
    /// Empty layout.
    pub const fn new() -> Self {
        Self { offset: 0 }
    }

    /// Reserve space for one `T`, starting on its own cache line. Returns its offset.
    pub fn add<T: ShmSafe>(&mut self) -> RtResult<usize> {
        self.add_raw(
            core::mem::size_of::<T>(),
            core::mem::align_of::<T>().max(CACHE_LINE_SIZE),
        )
    }

    /// Reserve `size` bytes aligned to `align`. Returns the offset.
    pub fn add_raw(&mut self, size: usize, align: usize) -> RtResult<usize> {
        if !align.is_power_of_two() {
            return Err(RtError::invalid("alignment must be a power of two"));
        }
        let start = self
            .offset
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or(RtError::invalid("segment layout overflow"))?;
        self.offset = start
            .checked_add(size)
            .ok_or(RtError::invalid("segment layout overflow"))?;
        Ok(start)
    }

    /// Bytes used so far.
    pub const fn len(&self) -> usize {
        self.offset
    }

    /// True if nothing has been added.
    pub const fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Total segment size, rounded up to a cache line.
    pub const fn finish(&self) -> usize {
        cache_aligned_size(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(cache_aligned_size(65), 128);
    }

    #[test]
    fn padded_occupies_full_line() {
        assert_eq!(core::mem::size_of::<CachePadded<u32>>(), CACHE_LINE_SIZE);
        let mut p = CachePadded::new(5u32);
        *p += 1;
        assert_eq!(p.into_inner(), 6);
    }

    #[test]
    fn layout_places_records_on_separate_lines() {
        let mut layout = SegmentLayout::new();
        assert!(layout.is_empty());
        let a = layout.add::<u8>().unwrap();
        let b = layout.add::<[u64; 10]>().unwrap();
        let c = layout.add::<u32>().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);
        assert_eq!(c, 192);
        assert_eq!(layout.len(), 196);
        assert_eq!(layout.finish(), 256);
    }

    #[test]
    fn layout_rejects_bad_alignment() {
        let mut layout = SegmentLayout::new();
        assert!(layout.add_raw(8, 3).is_err());
        assert!(layout.add_raw(usize::MAX, 1).is_ok());
        assert!(layout.add_raw(1, 1).is_err());
    }
}
