//! Apply real-time scheduling to threads.
//!
//! [`apply`] changes one thread's CPU affinity, scheduling policy and priority, and optionally
//! locks process memory, as described by a [`ScheduleConfig`]. The request is validated in full
//! before anything changes; if a later step is refused, the steps already taken are rolled
//! back, so the caller sees either the whole new schedule or the old one.
//!
//! Real-time classes need `CAP_SYS_NICE` (or a matching `RLIMIT_RTPRIO`); memory locking needs
//! `CAP_IPC_LOCK` (or a large enough `RLIMIT_MEMLOCK`). Lacking either gives
//! `PermissionDenied`. On hosts without Linux scheduling classes only the default policy is
//! accepted.

use core::sync::atomic::{AtomicBool, Ordering};
use rtcore::error::{RtError, RtResult};
use rtcore::schedule::ScheduleConfig;
use tracing::{debug, info, warn};

static MEMORY_LOCKED: AtomicBool = AtomicBool::new(false);

/// Stack bytes touched after locking memory so the pages are resident.
const PREFAULT_STACK_BYTES: usize = 256 * 1024;

/// Kernel thread targeted by [`apply`] and [`current_schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(i32);

impl ThreadHandle {
    /// The calling thread.
    pub const fn current() -> Self {
        Self(0)
    }

    /// A thread by kernel thread id.
    pub const fn from_tid(tid: i32) -> Self {
        Self(tid)
    }

    /// Kernel thread id of the calling thread, usable from other threads.
    pub fn this_thread() -> Self {
        Self(crate::platform::current_tid())
    }

    /// Raw id; 0 means the calling thread.
    pub const fn tid(self) -> i32 {
        self.0
    }
}

/// Apply `config` to `thread`.
///
/// Steps: validate, snapshot the current affinity and policy, set the affinity (when `cpus`
/// is non-empty), set policy and priority, lock memory (when requested). A failing step undoes
/// the earlier ones. Applying the same config twice changes nothing the second time.
///
/// # Errors
///
/// - `InvalidArgument` for a priority outside the policy's range or a CPU that does not exist
/// - `PermissionDenied` without the privilege for the real-time class or memory locking
/// - `SystemFailure` for other OS errors (e.g. the thread no longer exists)
#[cfg(target_os = "linux")]
pub fn apply(thread: ThreadHandle, config: &ScheduleConfig) -> RtResult<()> {
    config.validate()?;
    os::check_host_limits(config)?;

    let previous = os::Snapshot::take(thread)?;

    if !config.cpus.is_empty() {
        os::set_affinity(thread, &config.cpus)?;
    }

    if let Err(e) = os::set_scheduler(thread, config.policy, config.priority) {
        previous.restore_affinity(thread);
        warn!(tid = thread.tid(), error = %e, "scheduler change refused, affinity restored");
        return Err(e);
    }

    if config.lock_memory {
        if let Err(e) = lock_memory() {
            previous.restore_scheduler(thread);
            previous.restore_affinity(thread);
            warn!(tid = thread.tid(), error = %e, "memory lock refused, schedule restored");
            return Err(e);
        }
    }

    info!(
        tid = thread.tid(),
        policy = %config.policy,
        priority = config.priority,
        cpus = ?config.cpus.as_slice(),
        lock_memory = config.lock_memory,
        "schedule applied"
    );
    Ok(())
}

/// Apply `config` to `thread`. Only the default policy without affinity is available here.
#[cfg(not(target_os = "linux"))]
pub fn apply(_thread: ThreadHandle, config: &ScheduleConfig) -> RtResult<()> {
    config.validate()?;
    if config.policy.is_realtime() || !config.cpus.is_empty() {
        return Err(RtError::PermissionDenied {
            operation: "real-time scheduling unsupported on this platform",
        });
    }
    if config.lock_memory {
        lock_memory()?;
    }
    Ok(())
}

/// Read back the schedule of `thread`.
///
/// `cpus` is empty when the thread may run on every CPU; otherwise it lists the allowed CPUs
/// (at most [`MAX_CPUS`](rtcore::consts::MAX_CPUS) of them). `lock_memory` reports whether
/// [`lock_memory`] is in effect.
#[cfg(target_os = "linux")]
pub fn current_schedule(thread: ThreadHandle) -> RtResult<ScheduleConfig> {
    let snapshot = os::Snapshot::take(thread)?;
    Ok(ScheduleConfig {
        policy: snapshot.policy()?,
        priority: snapshot.priority(),
        cpus: snapshot.cpu_list(),
        lock_memory: MEMORY_LOCKED.load(Ordering::Relaxed),
    })
}

/// Read back the schedule of `thread`.
#[cfg(not(target_os = "linux"))]
pub fn current_schedule(_thread: ThreadHandle) -> RtResult<ScheduleConfig> {
    Ok(ScheduleConfig::normal().with_memory_lock(MEMORY_LOCKED.load(Ordering::Relaxed)))
}

/// Lock all current and future pages of the process into RAM.
///
/// On glibc also stops `free` from returning memory to the OS and from serving allocations
/// with fresh `mmap`s, so later allocations reuse locked pages. Touches part of the calling
/// thread's stack.
///
/// # Errors
///
/// `PermissionDenied` without `CAP_IPC_LOCK` when the request exceeds `RLIMIT_MEMLOCK`.
pub fn lock_memory() -> RtResult<()> {
    use nix::errno::Errno;
    use nix::sys::mman::{MlockAllFlags, mlockall};

    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE).map_err(|e| match e {
        Errno::ENOMEM | Errno::EPERM => RtError::PermissionDenied {
            operation: "mlockall",
        },
        other => RtError::from_errno("mlockall", other),
    })?;

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    // SAFETY: mallopt only adjusts allocator tunables.
    unsafe {
        libc::mallopt(libc::M_TRIM_THRESHOLD, -1);
        libc::mallopt(libc::M_MMAP_MAX, 0);
    }

    prefault_stack();
    MEMORY_LOCKED.store(true, Ordering::Relaxed);
    debug!("process memory locked");
    Ok(())
}

/// Undo [`lock_memory`].
pub fn unlock_memory() -> RtResult<()> {
    nix::sys::mman::munlockall().map_err(|e| RtError::from_errno("munlockall", e))?;
    MEMORY_LOCKED.store(false, Ordering::Relaxed);
    debug!("process memory unlocked");
    Ok(())
}

fn prefault_stack() {
    let mut buf = [0u8; PREFAULT_STACK_BYTES];
    for byte in buf.iter_mut() {
        // SAFETY: writing to a local buffer.
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    std::hint::black_box(&buf);
}

#[cfg(target_os = "linux")]
mod os {
    use super::ThreadHandle;
    use crate::platform::configured_cpus;
    use nix::errno::Errno;
    use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
    use nix::unistd::Pid;
    use rtcore::error::{RtError, RtResult};
    use rtcore::schedule::{CpuList, SchedPolicy, ScheduleConfig};
    use tracing::warn;

    pub(super) fn native_policy(policy: SchedPolicy) -> libc::c_int {
        match policy {
            SchedPolicy::Normal => libc::SCHED_OTHER,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }

    /// Check priority and CPUs against what this kernel and machine offer.
    pub(super) fn check_host_limits(config: &ScheduleConfig) -> RtResult<()> {
        let native = native_policy(config.policy);
        // SAFETY: pure queries.
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(native),
                libc::sched_get_priority_max(native),
            )
        };
        if min >= 0 && max >= 0 && !(min..=max).contains(&config.priority) {
            return Err(RtError::invalid("priority outside the kernel's range for policy"));
        }

        let available = configured_cpus().min(CpuSet::count());
        if config.cpus.iter().any(|&cpu| cpu >= available) {
            return Err(RtError::invalid("affinity names a CPU that does not exist"));
        }
        Ok(())
    }

    pub(super) fn set_affinity(thread: ThreadHandle, cpus: &[usize]) -> RtResult<()> {
        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)
                .map_err(|_| RtError::invalid("affinity names a CPU that does not exist"))?;
        }
        sched_setaffinity(Pid::from_raw(thread.tid()), &set)
            .map_err(|e| RtError::from_errno("sched_setaffinity", e))
    }

    pub(super) fn set_scheduler(
        thread: ThreadHandle,
        policy: SchedPolicy,
        priority: i32,
    ) -> RtResult<()> {
        set_native_scheduler(thread, native_policy(policy), priority)
    }

    pub(super) fn set_native_scheduler(
        thread: ThreadHandle,
        policy: libc::c_int,
        priority: i32,
    ) -> RtResult<()> {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: `param` is a valid sched_param.
        let ret = unsafe { libc::sched_setscheduler(thread.tid(), policy, &param) };
        if ret != 0 {
            return Err(RtError::from_errno("sched_setscheduler", Errno::last()));
        }
        Ok(())
    }

    /// Scheduling state of a thread before a change.
    pub(super) struct Snapshot {
        affinity: CpuSet,
        policy: libc::c_int,
        reset_on_fork: bool,
        priority: i32,
    }

    impl Snapshot {
        pub(super) fn take(thread: ThreadHandle) -> RtResult<Self> {
            let pid = Pid::from_raw(thread.tid());
            let affinity =
                sched_getaffinity(pid).map_err(|e| RtError::from_errno("sched_getaffinity", e))?;

            // SAFETY: plain query.
            let policy = unsafe { libc::sched_getscheduler(thread.tid()) };
            if policy < 0 {
                return Err(RtError::from_errno("sched_getscheduler", Errno::last()));
            }

            let mut param = libc::sched_param { sched_priority: 0 };
            // SAFETY: `param` is a valid out-pointer.
            if unsafe { libc::sched_getparam(thread.tid(), &mut param) } != 0 {
                return Err(RtError::from_errno("sched_getparam", Errno::last()));
            }

            Ok(Self {
                affinity,
                policy: policy & !libc::SCHED_RESET_ON_FORK,
                reset_on_fork: policy & libc::SCHED_RESET_ON_FORK != 0,
                priority: param.sched_priority,
            })
        }

        pub(super) fn policy(&self) -> RtResult<SchedPolicy> {
            match self.policy {
                libc::SCHED_FIFO => Ok(SchedPolicy::Fifo),
                libc::SCHED_RR => Ok(SchedPolicy::RoundRobin),
                libc::SCHED_OTHER | libc::SCHED_BATCH | libc::SCHED_IDLE => Ok(SchedPolicy::Normal),
                _ => Err(RtError::SystemFailure {
                    call: "sched_getscheduler",
                    errno: Errno::EINVAL,
                }),
            }
        }

        pub(super) fn priority(&self) -> i32 {
            self.priority
        }

        /// Saved policy including the reset-on-fork flag.
        pub(super) fn saved_policy(&self) -> libc::c_int {
            if self.reset_on_fork {
                self.policy | libc::SCHED_RESET_ON_FORK
            } else {
                self.policy
            }
        }

        pub(super) fn cpu_list(&self) -> CpuList {
            let available = configured_cpus().min(CpuSet::count());
            let allowed: Vec<usize> = (0..available)
                .filter(|&cpu| self.affinity.is_set(cpu).unwrap_or(false))
                .collect();
            let mut list = CpuList::new();
            if allowed.len() >= crate::platform::online_cpus() {
                return list;
            }
            for cpu in allowed {
                if list.push(cpu).is_err() {
                    break;
                }
            }
            list
        }

        pub(super) fn restore_affinity(&self, thread: ThreadHandle) {
            if let Err(e) = sched_setaffinity(Pid::from_raw(thread.tid()), &self.affinity) {
                warn!(tid = thread.tid(), error = %e, "failed to restore affinity");
            }
        }

        pub(super) fn restore_scheduler(&self, thread: ThreadHandle) {
            if let Err(e) = set_native_scheduler(thread, self.saved_policy(), self.priority) {
                warn!(tid = thread.tid(), error = %e, "failed to restore scheduler");
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use rtcore::error::ErrorKind;
    use rtcore::schedule::{CpuList, SchedPolicy};

    #[test]
    fn policy_mapping() {
        assert_eq!(os::native_policy(SchedPolicy::Normal), libc::SCHED_OTHER);
        assert_eq!(os::native_policy(SchedPolicy::Fifo), libc::SCHED_FIFO);
        assert_eq!(os::native_policy(SchedPolicy::RoundRobin), libc::SCHED_RR);
    }

    #[test]
    fn nonexistent_cpu_is_invalid() {
        let cfg = ScheduleConfig::normal()
            .with_cpus(&[rtcore::consts::MAX_CPU_INDEX])
            .unwrap();
        let before = current_schedule(ThreadHandle::current()).unwrap();
        let err = apply(ThreadHandle::current(), &cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(current_schedule(ThreadHandle::current()).unwrap(), before);
    }

    #[test]
    fn normal_schedule_is_idempotent() {
        let cfg = ScheduleConfig::normal();
        apply(ThreadHandle::current(), &cfg).unwrap();
        let once = current_schedule(ThreadHandle::current()).unwrap();
        apply(ThreadHandle::current(), &cfg).unwrap();
        assert_eq!(current_schedule(ThreadHandle::current()).unwrap(), once);
        assert_eq!(once.policy, SchedPolicy::Normal);
        assert_eq!(once.priority, 0);
    }

    #[test]
    fn pinning_to_first_cpu_round_trips() {
        let cfg = ScheduleConfig::normal().with_cpus(&[0]).unwrap();
        let thread = ThreadHandle::this_thread();
        match apply(thread, &cfg) {
            Ok(()) => {
                let now = current_schedule(thread).unwrap();
                if crate::platform::online_cpus() > 1 {
                    assert_eq!(now.cpus.as_slice(), &[0]);
                }
            }
            // CPU 0 may be excluded from this process's cpuset.
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidArgument),
        }
    }

    #[test]
    fn cpu_list_type_is_bounded() {
        let list = CpuList::new();
        assert_eq!(list.capacity(), rtcore::consts::MAX_CPUS);
    }

    #[test]
    fn restore_keeps_reset_on_fork() {
        std::thread::spawn(|| {
            let thread = ThreadHandle::this_thread();
            // Lowering to SCHED_OTHER with the flag is allowed without privileges.
            os::set_native_scheduler(thread, libc::SCHED_OTHER | libc::SCHED_RESET_ON_FORK, 0)
                .unwrap();
            let snapshot = os::Snapshot::take(thread).unwrap();
            assert_eq!(snapshot.policy().unwrap(), SchedPolicy::Normal);
            assert_eq!(
                snapshot.saved_policy(),
                libc::SCHED_OTHER | libc::SCHED_RESET_ON_FORK
            );

            // Clearing the flag needs CAP_SYS_NICE.
            let _ = os::set_native_scheduler(thread, libc::SCHED_OTHER, 0);
            snapshot.restore_scheduler(thread);
            // SAFETY: plain query.
            let policy = unsafe { libc::sched_getscheduler(thread.tid()) };
            assert_ne!(policy & libc::SCHED_RESET_ON_FORK, 0);
        })
        .join()
        .unwrap();
    }
}
