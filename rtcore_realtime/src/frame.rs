//! Multi-producer/single-consumer FIFO of fixed-size byte frames.
//!
//! A [`FrameBuffer`] holds `num_frames` frames of `frame_len` bytes in one allocation made at
//! construction. Producers and the consumer work on frames in place through closures, so a
//! message is never copied through an intermediate buffer.
//!
//! Writing reserves room on the shared `count` and takes a ticket from `head`, exactly like
//! [`BoundedMpscQueue`](crate::mpsc::BoundedMpscQueue): no step retries. A per-frame ready
//! flag publishes the frame to the consumer, which reads frames in ticket order and treats a
//! reserved but unpublished frame as [`Empty`].
//!
//! The frames keep whatever an earlier lap left in them; writers overwrite what they need.

use crate::layout::CachePadded;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use rtcore::error::{Empty, Full, RtError, RtResult};

/// Bounded FIFO of byte frames.
///
/// ```
/// use rtcore_realtime::frame::FrameBuffer;
///
/// let mut frames = FrameBuffer::new(16, 4).unwrap();
/// frames.try_write(|frame| frame[..5].copy_from_slice(b"hello")).unwrap();
/// let text = frames.try_read(|frame| frame[..5].to_vec()).unwrap();
/// assert_eq!(text, b"hello");
/// ```
pub struct FrameBuffer {
    frame_len: usize,
    mask: usize,
    count: CachePadded<AtomicUsize>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    ready: Box<[AtomicBool]>,
    data: Box<[UnsafeCell<u8>]>,
}

// Frame bytes are only touched by the holder of the frame's ticket.
unsafe impl Sync for FrameBuffer {}

impl FrameBuffer {
    /// Allocate `num_frames` zeroed frames of `frame_len` bytes each.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if either size is zero, `num_frames` is not a power of two, or the
    /// total does not fit in memory.
    pub fn new(frame_len: usize, num_frames: usize) -> RtResult<Self> {
        if frame_len == 0 {
            return Err(RtError::invalid("frame length must be non-zero"));
        }
        if !num_frames.is_power_of_two() {
            return Err(RtError::invalid("frame count must be a power of two"));
        }
        let total = frame_len
            .checked_mul(num_frames)
            .filter(|&t| t <= isize::MAX as usize)
            .ok_or(RtError::invalid("frame buffer too large"))?;

        Ok(Self {
            frame_len,
            mask: num_frames - 1,
            count: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            ready: (0..num_frames).map(|_| AtomicBool::new(false)).collect(),
            data: (0..total).map(|_| UnsafeCell::new(0)).collect(),
        })
    }

    /// Fill the next free frame in place, from any thread.
    ///
    /// The frame is published when `write` returns, also when it unwinds. If the buffer is
    /// full the closure is handed back without being called.
    pub fn try_write<F, R>(&self, write: F) -> Result<R, Full<F>>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        if self.count.fetch_add(1, Ordering::AcqRel) >= self.capacity() {
            self.count.fetch_sub(1, Ordering::Release);
            return Err(Full(write));
        }
        let index = self.head.fetch_add(1, Ordering::AcqRel) & self.mask;
        debug_assert!(!self.ready[index].load(Ordering::Relaxed), "reserved frame still unread");

        let _publish = Publish(&self.ready[index]);
        // SAFETY: the ticket makes this writer the only user of the frame, and the reservation
        // guarantees the consumer is done with its previous lap.
        let frame = unsafe { self.frame_mut(index) };
        Ok(write(frame))
    }

    /// Read the oldest published frame in place, from the exclusive owner.
    pub fn try_read<F, R>(&mut self, read: F) -> Result<R, Empty>
    where
        F: FnOnce(&[u8]) -> R,
    {
        // SAFETY: `&mut self` excludes every other reader.
        unsafe { self.read_shared(read) }
    }

    /// Split into a clonable writer handle and the single reader.
    pub fn split(&mut self) -> (FrameWriter<'_>, FrameReader<'_>) {
        (FrameWriter { buffer: self }, FrameReader { buffer: self })
    }

    /// # Safety
    ///
    /// Caller is the only reader.
    unsafe fn read_shared<F, R>(&self, read: F) -> Result<R, Empty>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let tail = self.tail.load(Ordering::Relaxed);
        let index = tail & self.mask;
        if !self.ready[index].load(Ordering::Acquire) {
            return Err(Empty);
        }

        let _release = Release {
            buffer: self,
            index,
            tail,
        };
        // SAFETY: the Acquire load published the writer's bytes and no writer owns this frame
        // until the reservation is returned.
        let frame = unsafe { self.frame(index) };
        Ok(read(frame))
    }

    /// # Safety
    ///
    /// Caller holds the frame's ticket.
    #[allow(clippy::mut_from_ref)]
    unsafe fn frame_mut(&self, index: usize) -> &mut [u8] {
        let start = index * self.frame_len;
        let base = UnsafeCell::raw_get(self.data[start..].as_ptr());
        // SAFETY: `start + frame_len` is within `data`; exclusivity is the caller's promise.
        unsafe { core::slice::from_raw_parts_mut(base, self.frame_len) }
    }

    /// # Safety
    ///
    /// The frame is published and no writer holds its ticket.
    unsafe fn frame(&self, index: usize) -> &[u8] {
        // SAFETY: forwarded from the caller.
        unsafe { self.frame_mut(index) }
    }

    /// Frames reserved or waiting to be read.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.capacity())
    }

    /// True if no frame is reserved or waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Bytes per frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("frame_len", &self.frame_len)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct Publish<'a>(&'a AtomicBool);

impl Drop for Publish<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Hands a read frame back to the writers, also when the reader unwinds.
struct Release<'a> {
    buffer: &'a FrameBuffer,
    index: usize,
    tail: usize,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let buffer = self.buffer;
        buffer.ready[self.index].store(false, Ordering::Relaxed);
        buffer.tail.store(self.tail.wrapping_add(1), Ordering::Relaxed);
        buffer.count.fetch_sub(1, Ordering::Release);
    }
}

/// Writing side of a [`FrameBuffer`]. Clone it for every producer thread.
#[derive(Clone)]
pub struct FrameWriter<'a> {
    buffer: &'a FrameBuffer,
}

impl FrameWriter<'_> {
    /// See [`FrameBuffer::try_write`].
    #[inline]
    pub fn try_write<F, R>(&self, write: F) -> Result<R, Full<F>>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.buffer.try_write(write)
    }

    /// Bytes per frame.
    pub fn frame_len(&self) -> usize {
        self.buffer.frame_len()
    }
}

/// Reading side of a [`FrameBuffer`].
pub struct FrameReader<'a> {
    buffer: &'a FrameBuffer,
}

impl FrameReader<'_> {
    /// See [`FrameBuffer::try_read`].
    #[inline]
    pub fn try_read<F, R>(&mut self, read: F) -> Result<R, Empty>
    where
        F: FnOnce(&[u8]) -> R,
    {
        // SAFETY: a `FrameReader` is unique by construction.
        unsafe { self.buffer.read_shared(read) }
    }

    /// Frames reserved or waiting to be read.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if no frame is reserved or waiting.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
