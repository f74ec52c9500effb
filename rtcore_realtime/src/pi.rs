//! Priority-inheriting mutex for locks shared by threads of different real-time priority.
//!
//! While a low-priority thread holds a [`PiMutex`] that a higher-priority thread is waiting
//! for, the kernel runs the holder at the waiter's priority. This bounds priority inversion,
//! which the plain futex protocol of [`ProcessMutex`](crate::sync::ProcessMutex) does not.
//!
//! The lock is a `pthread_mutex_t` configured with `PTHREAD_PRIO_INHERIT` and error checking,
//! boxed so its address stays fixed. It is for threads of one process.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use rtcore::error::{Errno, RtError, RtResult};

/// Mutex whose holder inherits the priority of its highest waiter.
///
/// ```
/// use rtcore_realtime::pi::PiMutex;
///
/// let state = PiMutex::new(Vec::<u32>::new()).unwrap();
/// state.lock().unwrap().push(3);
/// assert_eq!(state.lock().unwrap().len(), 1);
/// ```
pub struct PiMutex<T> {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for PiMutex<T> {}
unsafe impl<T: Send> Sync for PiMutex<T> {}

fn check(call: &'static str, ret: libc::c_int) -> RtResult<()> {
    match ret {
        0 => Ok(()),
        errno => Err(RtError::from_errno(call, Errno::from_raw(errno))),
    }
}

impl<T> PiMutex<T> {
    /// Unlocked mutex holding `value`.
    ///
    /// # Errors
    ///
    /// `SystemFailure` if the C library rejects the priority-inheritance protocol.
    pub fn new(value: T) -> RtResult<Self> {
        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        let mut attr = core::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        // SAFETY: `attr` is initialized by pthread_mutexattr_init before any other use and
        // destroyed on every path after it; `raw` is boxed and not yet shared.
        unsafe {
            check(
                "pthread_mutexattr_init",
                libc::pthread_mutexattr_init(attr.as_mut_ptr()),
            )?;
            let configured = check(
                "pthread_mutexattr_setprotocol",
                libc::pthread_mutexattr_setprotocol(attr.as_mut_ptr(), libc::PTHREAD_PRIO_INHERIT),
            )
            .and_then(|()| {
                check(
                    "pthread_mutexattr_settype",
                    libc::pthread_mutexattr_settype(
                        attr.as_mut_ptr(),
                        libc::PTHREAD_MUTEX_ERRORCHECK,
                    ),
                )
            })
            .and_then(|()| {
                check(
                    "pthread_mutex_init",
                    libc::pthread_mutex_init(raw.get(), attr.as_ptr()),
                )
            });
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            configured?;
        }

        Ok(Self {
            raw,
            data: UnsafeCell::new(value),
        })
    }

    /// Block until the lock is acquired.
    ///
    /// # Errors
    ///
    /// `SystemFailure` with `EDEADLK` if the calling thread already holds the lock.
    pub fn lock(&self) -> RtResult<PiMutexGuard<'_, T>> {
        // SAFETY: the mutex was initialized in `new` and never moves.
        check("pthread_mutex_lock", unsafe {
            libc::pthread_mutex_lock(self.raw.get())
        })?;
        Ok(PiMutexGuard { mutex: self })
    }

    /// Acquire without blocking. `None` while any thread, including this one, holds it.
    pub fn try_lock(&self) -> Option<PiMutexGuard<'_, T>> {
        // SAFETY: as in `lock`.
        let ret = unsafe { libc::pthread_mutex_trylock(self.raw.get()) };
        (ret == 0).then(|| PiMutexGuard { mutex: self })
    }

    /// Payload access through exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the mutex.
    pub fn into_inner(self) -> T {
        let this = core::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never used again; the mutex is unlocked because no guard can
        // outlive the borrow that produced it.
        unsafe {
            libc::pthread_mutex_destroy(this.raw.get());
            drop(core::ptr::read(&this.raw));
            core::ptr::read(&this.data).into_inner()
        }
    }
}

impl<T> Drop for PiMutex<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no guard is alive, so the mutex is unlocked.
        unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
    }
}

impl<T> fmt::Debug for PiMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiMutex")
            .field("locked", &self.try_lock().is_none())
            .finish_non_exhaustive()
    }
}

/// Holds a [`PiMutex`] locked until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PiMutexGuard<'a, T> {
    mutex: &'a PiMutex<T>,
}

impl<T> Deref for PiMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for PiMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for PiMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this thread holds the lock, so unlocking cannot fail.
        unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{ThreadHandle, apply};
    use rtcore::error::ErrorKind;
    use rtcore::schedule::ScheduleConfig;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lock_and_try_lock() {
        let mutex = PiMutex::new(0u32).unwrap();
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);

        *mutex.lock().unwrap() += 1;
        assert_eq!(*mutex.try_lock().unwrap(), 1);
        assert_eq!(mutex.into_inner(), 1);
    }

    #[test]
    fn relocking_from_the_holder_is_an_error() {
        let mutex = PiMutex::new(()).unwrap();
        let _held = mutex.lock().unwrap();
        let err = mutex.lock().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SystemFailure);
        assert_eq!(
            err,
            RtError::SystemFailure {
                call: "pthread_mutex_lock",
                errno: Errno::EDEADLK
            }
        );
    }

    #[test]
    fn threads_are_serialized() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 10_000;
        let mutex = Arc::new(PiMutex::new(0u64).unwrap());

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        *mutex.lock().unwrap() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*mutex.lock().unwrap(), THREADS as u64 * ROUNDS);
    }

    #[test]
    fn real_time_waiter_gets_the_lock_from_a_normal_holder() {
        let mutex = Arc::new(PiMutex::new(0u32).unwrap());
        let held = mutex.lock().unwrap();

        let waiter = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || {
                // Without privileges the waiter stays SCHED_OTHER; locking must work either way.
                let _ = apply(ThreadHandle::current(), &ScheduleConfig::fifo(10));
                *mutex.lock().unwrap() += 1;
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap();
        assert_eq!(*mutex.lock().unwrap(), 1);
    }
}
