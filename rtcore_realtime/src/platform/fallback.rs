//! Portable stand-ins for hosts without futexes. Waiting degrades to yielding polls.

use core::sync::atomic::{AtomicU32, Ordering};
use rtcore::error::{RtError, RtResult};
use std::time::{Duration, Instant};

/// Poll until `*word != expected` or `timeout` elapses.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> RtResult<()> {
    let deadline = timeout.map(|t| Instant::now() + t);
    while word.load(Ordering::Acquire) == expected {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(RtError::Timeout);
        }
        std::thread::yield_now();
    }
    Ok(())
}

/// Pollers notice value changes on their own.
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> RtResult<usize> {
    Ok(0)
}

/// Number of CPUs available to this process.
pub fn online_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Same as [`online_cpus`] on this host.
pub fn configured_cpus() -> usize {
    online_cpus()
}

/// Thread ids are not exposed here.
pub fn current_tid() -> i32 {
    0
}
