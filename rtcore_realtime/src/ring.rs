//! Wait-free single-producer/single-consumer ring buffer.
//!
//! [`RingBuffer`] stores up to `C` items inline; `C` must be a power of two so that slot
//! indices stay consistent when the cursors wrap. The producer owns the write cursor and the
//! consumer owns the read cursor; each side publishes its cursor with `Release` and reads the
//! other side's with `Acquire`. Cursors increase monotonically (wrapping at `usize::MAX`) and
//! the fill level is always `write - read` in `[0, C]`.
//!
//! Within one process use [`RingBuffer::split`], which hands out exactly one [`Producer`] and
//! one [`Consumer`]. Across processes the buffer is placed in a shared memory segment and each
//! side obtains its handle with the `unsafe` [`RingBuffer::producer_unchecked`] /
//! [`RingBuffer::consumer_unchecked`].

use crate::layout::{CachePadded, ShmSafe, ShmShared};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};
use rtcore::error::{Empty, Overflow};

/// Bounded SPSC buffer holding at most `C` items of type `T`.
///
/// ```
/// use rtcore_realtime::ring::RingBuffer;
///
/// let mut ring = RingBuffer::<u32, 4>::new();
/// let (mut tx, mut rx) = ring.split();
/// tx.try_push(7).unwrap();
/// assert_eq!(rx.try_pop(), Ok(7));
/// assert!(rx.try_pop().is_err());
/// ```
#[repr(C)]
pub struct RingBuffer<T, const C: usize> {
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
    slots: [UnsafeCell<MaybeUninit<T>>; C],
}

unsafe impl<T: Send, const C: usize> Sync for RingBuffer<T, C> {}

// All-zero cursors are an empty buffer and slots are uninitialized storage.
unsafe impl<T: Copy + ShmSafe, const C: usize> ShmSafe for RingBuffer<T, C> {}
unsafe impl<T: Copy + ShmSafe, const C: usize> ShmShared for RingBuffer<T, C> {}

impl<T, const C: usize> RingBuffer<T, C> {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        const { assert!(C.is_power_of_two(), "RingBuffer capacity must be a power of two") };
        Self {
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; C],
        }
    }

    /// Split into the producer and consumer halves.
    pub fn split(&mut self) -> (Producer<'_, T, C>, Consumer<'_, T, C>) {
        (Producer { ring: self }, Consumer { ring: self })
    }

    /// Producer handle without exclusivity checks.
    ///
    /// # Safety
    ///
    /// At most one producer handle may exist for this buffer at any time, across all threads
    /// and processes sharing it.
    pub unsafe fn producer_unchecked(&self) -> Producer<'_, T, C> {
        Producer { ring: self }
    }

    /// Consumer handle without exclusivity checks.
    ///
    /// # Safety
    ///
    /// At most one consumer handle may exist for this buffer at any time, across all threads
    /// and processes sharing it.
    pub unsafe fn consumer_unchecked(&self) -> Consumer<'_, T, C> {
        Consumer { ring: self }
    }

    /// Push from the exclusive owner.
    pub fn try_push(&mut self, item: T) -> Result<(), Overflow<T>> {
        // SAFETY: `&mut self` excludes every other handle.
        unsafe { self.push_shared(item) }
    }

    /// Pop from the exclusive owner.
    pub fn try_pop(&mut self) -> Result<T, Empty> {
        // SAFETY: `&mut self` excludes every other handle.
        unsafe { self.pop_shared() }
    }

    /// Number of items currently stored.
    ///
    /// Exact when called from the producer or consumer; a snapshot otherwise.
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.wrapping_sub(read).min(C)
    }

    /// Maximum number of items.
    pub const fn capacity(&self) -> usize {
        C
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if a push would overflow.
    pub fn is_full(&self) -> bool {
        self.len() == C
    }

    /// # Safety
    ///
    /// Caller is the only producer.
    #[inline]
    unsafe fn push_shared(&self, item: T) -> Result<(), Overflow<T>> {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) >= C {
            return Err(Overflow(item));
        }
        // SAFETY: the slot is outside [read, write) so the consumer does not touch it, and we
        // are the only producer.
        unsafe { (*self.slots[write & (C - 1)].get()).write(item) };
        self.write.store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Caller is the only consumer.
    #[inline]
    unsafe fn pop_shared(&self) -> Result<T, Empty> {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if write == read {
            return Err(Empty);
        }
        // SAFETY: the slot is inside [read, write), initialized by the producer and published
        // by the Acquire load above.
        let item = unsafe { (*self.slots[read & (C - 1)].get()).assume_init_read() };
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Ok(item)
    }
}

impl<T, const C: usize> Default for RingBuffer<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const C: usize> Drop for RingBuffer<T, C> {
    fn drop(&mut self) {
        if core::mem::needs_drop::<T>() {
            while self.try_pop().is_ok() {}
        }
    }
}

impl<T, const C: usize> fmt::Debug for RingBuffer<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.len())
            .field("capacity", &C)
            .finish()
    }
}

/// Writing half of a [`RingBuffer`].
pub struct Producer<'a, T, const C: usize> {
    ring: &'a RingBuffer<T, C>,
}

impl<T, const C: usize> Producer<'_, T, C> {
    /// Append an item, or hand it back if the buffer is full.
    #[inline]
    pub fn try_push(&mut self, item: T) -> Result<(), Overflow<T>> {
        // SAFETY: a `Producer` is unique by construction or by the caller's promise.
        unsafe { self.ring.push_shared(item) }
    }

    /// Items currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// True if a push would overflow.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Maximum number of items.
    pub const fn capacity(&self) -> usize {
        C
    }
}

/// Reading half of a [`RingBuffer`].
pub struct Consumer<'a, T, const C: usize> {
    ring: &'a RingBuffer<T, C>,
}

impl<T, const C: usize> Consumer<'_, T, C> {
    /// Take the oldest item.
    #[inline]
    pub fn try_pop(&mut self) -> Result<T, Empty> {
        // SAFETY: a `Consumer` is unique by construction or by the caller's promise.
        unsafe { self.ring.pop_shared() }
    }

    /// Items currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// True if a push would overflow.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Maximum number of items.
    pub const fn capacity(&self) -> usize {
        C
    }
}
