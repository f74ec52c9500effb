//! Linux futex and topology calls.

use core::ptr;
use core::sync::atomic::AtomicU32;
use rtcore::error::{Errno, RtError, RtResult};
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout`.
///
/// The futex is not `FUTEX_PRIVATE_FLAG`, so the wait is keyed on the physical page and works
/// for words in shared memory mapped at different addresses. Returns `Ok(())` when woken, when
/// the value already differed, or on a signal; callers re-check their condition.
///
/// # Errors
///
/// `Timeout` if `timeout` elapsed, `SystemFailure` for any other futex error.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> RtResult<()> {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    match Errno::last() {
        Errno::EAGAIN | Errno::EINTR => Ok(()),
        Errno::ETIMEDOUT => Err(RtError::Timeout),
        errno => Err(RtError::SystemFailure {
            call: "futex_wait",
            errno,
        }),
    }
}

/// Wake up to `count` threads blocked in [`futex_wait`] on `word`. Returns how many woke.
pub fn futex_wake(word: &AtomicU32, count: u32) -> RtResult<usize> {
    let count = count.min(i32::MAX as u32) as i32;
    // SAFETY: `word` is a valid, aligned u32 for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc < 0 {
        return Err(RtError::SystemFailure {
            call: "futex_wake",
            errno: Errno::last(),
        });
    }
    Ok(rc as usize)
}

/// Number of CPUs currently online.
pub fn online_cpus() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 { 1 } else { n as usize }
}

/// Number of CPUs the kernel was configured with, online or not.
pub fn configured_cpus() -> usize {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 { online_cpus() } else { n as usize }
}

/// Kernel thread id of the calling thread.
pub fn current_tid() -> i32 {
    nix::unistd::gettid().as_raw()
}
