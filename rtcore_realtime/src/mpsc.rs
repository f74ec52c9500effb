//! Bounded lock-free multi-producer/single-consumer queue.
//!
//! A producer first reserves room by incrementing the shared `count`. If the previous value
//! already reached the capacity it gives the reservation back and fails with [`Full`]. A
//! successful reservation then takes a ticket with one fetch-and-increment on `head`. Neither
//! step retries, so an enqueue completes in a fixed number of atomic operations regardless of
//! how many producers race.
//!
//! Every slot carries a sequence number doubling as its ready flag. For the ticket `pos` that
//! maps onto a slot:
//!
//! - sequence `pos`: the slot is free for the producer holding `pos`,
//! - sequence `pos + 1`: the slot holds the item for `pos`, ready for the consumer,
//! - sequence `pos + C`: the consumer released it for the next lap.
//!
//! The consumer owns `tail`, reads a slot only once its sequence shows the item published and
//! returns the reservation after releasing the slot. A claimed but unpublished slot reads as
//! [`Empty`], never as a half-written item.
//!
//! Sequences are stored relative to the slot index, so an all-zero queue (a freshly created
//! shared memory segment) is a valid empty queue.

use crate::layout::{CachePadded, ShmSafe, ShmShared};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};
use rtcore::error::{Empty, Full};

#[repr(C)]
struct Slot<T> {
    /// Sequence number minus the slot index.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const EMPTY: Self = Self {
        seq: AtomicUsize::new(0),
        value: UnsafeCell::new(MaybeUninit::uninit()),
    };
}

/// Fixed-capacity MPSC queue. `C` must be a power of two.
///
/// ```
/// use rtcore_realtime::mpsc::BoundedMpscQueue;
///
/// let mut queue = BoundedMpscQueue::<u32, 8>::new();
/// queue.try_enqueue(1).unwrap();
/// queue.try_enqueue(2).unwrap();
/// assert_eq!(queue.try_dequeue(), Ok(1));
/// assert_eq!(queue.try_dequeue(), Ok(2));
/// ```
#[repr(C)]
pub struct BoundedMpscQueue<T, const C: usize> {
    head: CachePadded<AtomicUsize>,
    count: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: [Slot<T>; C],
}

unsafe impl<T: Send, const C: usize> Sync for BoundedMpscQueue<T, C> {}

unsafe impl<T: Copy + ShmSafe, const C: usize> ShmSafe for BoundedMpscQueue<T, C> {}
unsafe impl<T: Copy + ShmSafe, const C: usize> ShmShared for BoundedMpscQueue<T, C> {}

impl<T, const C: usize> BoundedMpscQueue<T, C> {
    const MASK: usize = C - 1;

    /// Create an empty queue.
    pub const fn new() -> Self {
        const { assert!(C.is_power_of_two(), "queue capacity must be a power of two") };
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            count: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots: [const { Slot::EMPTY }; C],
        }
    }

    #[inline]
    fn sequence(&self, index: usize) -> usize {
        self.slots[index].seq.load(Ordering::Acquire).wrapping_add(index)
    }

    #[inline]
    fn set_sequence(&self, index: usize, seq: usize) {
        self.slots[index]
            .seq
            .store(seq.wrapping_sub(index), Ordering::Release);
    }

    /// Enqueue from any thread. Fails with the item handed back when the queue is full.
    pub fn try_enqueue(&self, item: T) -> Result<(), Full<T>> {
        if self.count.fetch_add(1, Ordering::AcqRel) >= C {
            self.count.fetch_sub(1, Ordering::Release);
            return Err(Full(item));
        }
        // The reservation chain on `count` orders the consumer's release of the previous lap
        // before this ticket; AcqRel on `head` carries it to whichever producer ends up here.
        let pos = self.head.fetch_add(1, Ordering::AcqRel);
        let index = pos & Self::MASK;
        debug_assert_eq!(self.sequence(index), pos, "reserved slot still occupied");
        // SAFETY: ticket `pos` is unique to this producer and the reservation guarantees the
        // consumer has released the slot's previous lap.
        unsafe { (*self.slots[index].value.get()).write(item) };
        self.set_sequence(index, pos.wrapping_add(1));
        Ok(())
    }

    /// Dequeue from the exclusive owner.
    pub fn try_dequeue(&mut self) -> Result<T, Empty> {
        // SAFETY: `&mut self` excludes every other consumer.
        unsafe { self.dequeue_shared() }
    }

    /// Split into a clonable producer handle and the single consumer.
    pub fn split(&mut self) -> (MpscProducer<'_, T, C>, MpscConsumer<'_, T, C>) {
        (MpscProducer { queue: self }, MpscConsumer { queue: self })
    }

    /// Consumer handle without exclusivity checks.
    ///
    /// # Safety
    ///
    /// At most one consumer handle may exist for this queue at any time, across all threads
    /// and processes sharing it.
    pub unsafe fn consumer_unchecked(&self) -> MpscConsumer<'_, T, C> {
        MpscConsumer { queue: self }
    }

    /// # Safety
    ///
    /// Caller is the only consumer.
    unsafe fn dequeue_shared(&self) -> Result<T, Empty> {
        let pos = self.tail.load(Ordering::Relaxed);
        let index = pos & Self::MASK;
        if self.sequence(index) != pos.wrapping_add(1) {
            return Err(Empty);
        }
        // SAFETY: the Acquire load of the sequence published the producer's write.
        let item = unsafe { (*self.slots[index].value.get()).assume_init_read() };
        self.set_sequence(index, pos.wrapping_add(C));
        self.tail.store(pos.wrapping_add(1), Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Release);
        Ok(item)
    }

    /// Approximate number of queued items, including claimed but not yet published ones.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(C)
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued items.
    pub const fn capacity(&self) -> usize {
        C
    }
}

impl<T, const C: usize> Default for BoundedMpscQueue<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const C: usize> Drop for BoundedMpscQueue<T, C> {
    fn drop(&mut self) {
        if core::mem::needs_drop::<T>() {
            while self.try_dequeue().is_ok() {}
        }
    }
}

impl<T, const C: usize> fmt::Debug for BoundedMpscQueue<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedMpscQueue")
            .field("len", &self.len())
            .field("capacity", &C)
            .finish()
    }
}

/// Producer side of a [`BoundedMpscQueue`]. Clone it for every producer thread.
pub struct MpscProducer<'a, T, const C: usize> {
    queue: &'a BoundedMpscQueue<T, C>,
}

impl<T, const C: usize> Clone for MpscProducer<'_, T, C> {
    fn clone(&self) -> Self {
        Self { queue: self.queue }
    }
}

impl<T, const C: usize> MpscProducer<'_, T, C> {
    /// See [`BoundedMpscQueue::try_enqueue`].
    #[inline]
    pub fn try_enqueue(&self, item: T) -> Result<(), Full<T>> {
        self.queue.try_enqueue(item)
    }
}

/// Consumer side of a [`BoundedMpscQueue`].
pub struct MpscConsumer<'a, T, const C: usize> {
    queue: &'a BoundedMpscQueue<T, C>,
}

impl<T, const C: usize> MpscConsumer<'_, T, C> {
    /// Take the next published item.
    #[inline]
    pub fn try_dequeue(&mut self) -> Result<T, Empty> {
        // SAFETY: an `MpscConsumer` is unique by construction or by the caller's promise.
        unsafe { self.queue.dequeue_shared() }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_then_reports_full() {
        let mut queue = BoundedMpscQueue::<u32, 4>::new();
        for i in 0..4 {
            queue.try_enqueue(i).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.try_enqueue(9).unwrap_err().into_inner(), 9);

        assert_eq!(queue.try_dequeue(), Ok(0));
        queue.try_enqueue(4).unwrap();
        for i in 1..5 {
            assert_eq!(queue.try_dequeue(), Ok(i));
        }
        assert_eq!(queue.try_dequeue(), Err(Empty));
        assert!(queue.is_empty());
    }

    #[test]
    fn zeroed_storage_is_an_empty_queue() {
        let mut queue: BoundedMpscQueue<u64, 8> =
            unsafe { core::mem::MaybeUninit::zeroed().assume_init() };
        assert!(queue.is_empty());
        assert_eq!(queue.try_dequeue(), Err(Empty));
        for lap in 0..3u64 {
            for i in 0..8 {
                queue.try_enqueue(lap * 8 + i).unwrap();
            }
            assert!(queue.try_enqueue(0).is_err());
            for i in 0..8 {
                assert_eq!(queue.try_dequeue(), Ok(lap * 8 + i));
            }
        }
    }

    #[test]
    fn sequences_survive_counter_wrap() {
        let mut queue = BoundedMpscQueue::<u32, 4>::new();
        let start = usize::MAX - 5;
        queue.head.store(start, Ordering::Relaxed);
        queue.tail.store(start, Ordering::Relaxed);
        for i in 0..4 {
            queue.set_sequence(i, start.wrapping_add((i.wrapping_sub(start)) & 3));
        }

        for round in 0..6u32 {
            queue.try_enqueue(round).unwrap();
            queue.try_enqueue(round + 10).unwrap();
            assert_eq!(queue.try_dequeue(), Ok(round));
            assert_eq!(queue.try_dequeue(), Ok(round + 10));
        }
    }

    #[test]
    fn consumer_skips_unpublished_slot() {
        let mut queue = BoundedMpscQueue::<u8, 2>::new();
        // Ticket 0 claimed but not yet published.
        queue.count.store(1, Ordering::Relaxed);
        queue.head.store(1, Ordering::Relaxed);
        assert_eq!(queue.try_dequeue(), Err(Empty));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rejected_enqueue_takes_no_ticket() {
        let mut queue = BoundedMpscQueue::<u32, 4>::new();
        for i in 0..4 {
            queue.try_enqueue(i).unwrap();
        }
        for _ in 0..3 {
            assert!(queue.try_enqueue(99).is_err());
        }
        assert_eq!(queue.head.load(Ordering::Relaxed), 4);
        assert_eq!(queue.count.load(Ordering::Relaxed), 4);

        assert_eq!(queue.try_dequeue(), Ok(0));
        assert_eq!(queue.count.load(Ordering::Relaxed), 3);
        queue.try_enqueue(4).unwrap();
        assert_eq!(queue.head.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn racing_producers_never_exceed_capacity() {
        const PRODUCERS: usize = 8;
        let queue = BoundedMpscQueue::<usize, 4>::new();
        let accepted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..PRODUCERS {
                s.spawn(|| {
                    for i in 0..1_000 {
                        if queue.try_enqueue(i).is_ok() {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(accepted.load(Ordering::Relaxed), 4);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.head.load(Ordering::Relaxed), 4);
    }
}
