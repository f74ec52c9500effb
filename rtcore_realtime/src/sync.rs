//! Futex-backed mutex and condition variable usable across processes.
//!
//! Both types are flat control blocks of two `u32` words, valid when zeroed, meant to live
//! inside a [`SharedMemorySegment`](crate::segment::SharedMemorySegment). Every participant
//! must reach the control block at the same offset of the same OS object.
//!
//! Mutex states:
//!
//! ```text
//! 0 unlocked --lock (CAS)--> 1 locked --contention--> 2 locked, waiters --unlock--> 0
//! ```
//!
//! The uncontended path is a single compare-and-swap. A contended locker moves the state to 2
//! and sleeps on the state word; `unlock` issues a wake only when it leaves state 2.
//!
//! A holder that dies while holding the lock leaves it locked forever. There is no owner
//! tracking and no robust-futex recovery.

use crate::layout::{ShmSafe, ShmShared};
use crate::platform::{futex_wait, futex_wake};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};
use rtcore::error::{RtError, RtResult};
use static_assertions::const_assert_eq;
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Process-shared lock word without payload.
#[repr(C)]
#[derive(Default)]
pub struct RawProcessMutex {
    state: AtomicU32,
    waiters: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<RawProcessMutex>(), 8);
const_assert_eq!(core::mem::align_of::<RawProcessMutex>(), 4);

unsafe impl ShmSafe for RawProcessMutex {}
unsafe impl ShmShared for RawProcessMutex {}

impl RawProcessMutex {
    /// Unlocked mutex.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            waiters: AtomicU32::new(0),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        // Without a deadline the only errors are transient futex failures; retry.
        while self.lock_contended(None).is_err() {
            std::thread::yield_now();
        }
    }

    /// Acquire without blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if the lock was not acquired in time.
    pub fn try_lock_for(&self, timeout: Duration) -> RtResult<()> {
        if self.try_lock() {
            return Ok(());
        }
        let deadline = Instant::now().checked_add(timeout);
        self.lock_contended(deadline)
    }

    fn lock_contended(&self, deadline: Option<Instant>) -> RtResult<()> {
        let mut state = self.state.swap(CONTENDED, Ordering::Acquire);
        while state != UNLOCKED {
            let timeout = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(RtError::Timeout);
                    }
                    Some(d - now)
                }
            };

            self.waiters.fetch_add(1, Ordering::Relaxed);
            let result = futex_wait(&self.state, CONTENDED, timeout);
            self.waiters.fetch_sub(1, Ordering::Relaxed);
            match result {
                Ok(()) | Err(RtError::Timeout) => {}
                Err(e) => return Err(e),
            }

            state = self.state.swap(CONTENDED, Ordering::Acquire);
        }
        Ok(())
    }

    /// Release the lock, waking one waiter if any were recorded.
    ///
    /// Calling this without holding the lock breaks mutual exclusion.
    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let _ = futex_wake(&self.state, 1);
        }
    }

    /// True while some participant holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Number of participants currently sleeping on the lock.
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for RawProcessMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawProcessMutex")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// Process-shared mutex guarding a flat payload stored next to the lock word.
///
/// ```
/// use rtcore_realtime::sync::ProcessMutex;
///
/// let counter = ProcessMutex::new(0u64);
/// *counter.lock() += 1;
/// assert_eq!(*counter.lock(), 1);
/// ```
#[repr(C)]
#[derive(Default)]
pub struct ProcessMutex<T> {
    raw: RawProcessMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for ProcessMutex<T> {}
unsafe impl<T: ShmSafe> ShmSafe for ProcessMutex<T> {}
unsafe impl<T: ShmSafe> ShmShared for ProcessMutex<T> {}

impl<T> ProcessMutex<T> {
    /// Unlocked mutex holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawProcessMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> ProcessMutexGuard<'_, T> {
        self.raw.lock();
        ProcessMutexGuard { mutex: self }
    }

    /// Acquire without blocking.
    pub fn try_lock(&self) -> Option<ProcessMutexGuard<'_, T>> {
        self.raw
            .try_lock()
            .then(|| ProcessMutexGuard { mutex: self })
    }

    /// Acquire, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> RtResult<ProcessMutexGuard<'_, T>> {
        self.raw.try_lock_for(timeout)?;
        Ok(ProcessMutexGuard { mutex: self })
    }

    /// The underlying lock word.
    pub fn raw(&self) -> &RawProcessMutex {
        &self.raw
    }

    /// Payload access through exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the mutex.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> fmt::Debug for ProcessMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMutex")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

/// Holds a [`ProcessMutex`] locked until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ProcessMutexGuard<'a, T> {
    mutex: &'a ProcessMutex<T>,
}

impl<T> ProcessMutexGuard<'_, T> {
    /// Release the lock.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T> Deref for ProcessMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ProcessMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ProcessMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

/// Outcome of a timed condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    timed_out: bool,
}

impl WaitTimeout {
    /// True if the wait ended because the timeout elapsed.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

/// Process-shared condition variable built on a generation counter.
///
/// A waiter records the generation while holding the mutex, releases the mutex and sleeps
/// until the generation moves. Wake-ups may be spurious; use the `*_while` forms.
///
/// Notifying does not require holding the mutex. The waiter count and the generation are
/// ordered sequentially consistent, so a notifier either sees the waiter registered or the
/// waiter sees the new generation and does not sleep.
#[repr(C)]
#[derive(Default)]
pub struct ProcessCondvar {
    generation: AtomicU32,
    waiters: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<ProcessCondvar>(), 8);

unsafe impl ShmSafe for ProcessCondvar {}
unsafe impl ShmShared for ProcessCondvar {}

impl ProcessCondvar {
    /// Condition variable with no waiters.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    /// Release `guard`, sleep until notified, and re-acquire.
    pub fn wait<'a, T>(&self, guard: ProcessMutexGuard<'a, T>) -> ProcessMutexGuard<'a, T> {
        let (guard, _) = self.wait_inner(guard, None);
        guard
    }

    /// Wait until `condition` returns false.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: ProcessMutexGuard<'a, T>,
        mut condition: F,
    ) -> ProcessMutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Like [`wait`](Self::wait), for at most `timeout`.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: ProcessMutexGuard<'a, T>,
        timeout: Duration,
    ) -> (ProcessMutexGuard<'a, T>, WaitTimeout) {
        self.wait_inner(guard, Some(timeout))
    }

    /// Wait until `condition` returns false or `timeout` elapses.
    ///
    /// On timeout the returned flag is set and the condition still held at the last check.
    pub fn wait_timeout_while<'a, T, F>(
        &self,
        mut guard: ProcessMutexGuard<'a, T>,
        timeout: Duration,
        mut condition: F,
    ) -> (ProcessMutexGuard<'a, T>, WaitTimeout)
    where
        F: FnMut(&mut T) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        while condition(&mut *guard) {
            let remaining = match deadline {
                None => None,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(r) if !r.is_zero() => Some(r),
                    _ => return (guard, WaitTimeout { timed_out: true }),
                },
            };
            guard = self.wait_inner(guard, remaining).0;
        }
        (guard, WaitTimeout { timed_out: false })
    }

    fn wait_inner<'a, T>(
        &self,
        guard: ProcessMutexGuard<'a, T>,
        timeout: Option<Duration>,
    ) -> (ProcessMutexGuard<'a, T>, WaitTimeout) {
        let mutex = guard.mutex;
        let generation = self.generation.load(Ordering::Acquire);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        let result = futex_wait(&self.generation, generation, timeout);

        self.waiters.fetch_sub(1, Ordering::Relaxed);
        let timed_out = matches!(result, Err(RtError::Timeout));
        (mutex.lock(), WaitTimeout { timed_out })
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _ = futex_wake(&self.generation, 1);
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _ = futex_wake(&self.generation, u32::MAX);
        }
    }
}

impl fmt::Debug for ProcessCondvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCondvar")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}
