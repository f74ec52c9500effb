//! Periodic real-time worker thread.
//!
//! A [`PeriodicThread`] runs a [`PeriodicTask`] on its own OS thread: optional schedule
//! application, `setup`, then `process` once per interval until stopped, then `teardown`.
//! Wake-ups are paced against absolute deadlines on the monotonic clock, so the period does
//! not drift with the time spent in `process`.

use crate::sched::{self, ThreadHandle};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use rtcore::error::{Errno, RtError, RtResult};
use rtcore::schedule::ScheduleConfig;
use rtcore::string::BoundedString;
use std::sync::Arc;
use std::sync::mpsc::sync_channel;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Thread names longer than this are truncated.
pub type ThreadName = BoundedString<32>;

/// Work executed by a [`PeriodicThread`].
pub trait PeriodicTask: Send + 'static {
    /// Runs once on the worker thread after the schedule is applied.
    fn setup(&mut self) -> RtResult<()> {
        Ok(())
    }

    /// Runs once per period. An error stops the thread.
    fn process(&mut self) -> RtResult<()>;

    /// Runs once when the loop ends, also after a `process` error.
    fn teardown(&mut self) {}
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    overruns: AtomicU64,
}

/// Handle to a periodic worker thread.
pub struct PeriodicThread {
    name: ThreadName,
    interval: Duration,
    schedule: Option<ScheduleConfig>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<RtResult<()>>>,
}

impl PeriodicThread {
    /// Describe a thread that runs every `interval`.
    pub fn new(name: &str, interval: Duration) -> Self {
        Self {
            name: ThreadName::from(name),
            interval,
            schedule: None,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            handle: None,
        }
    }

    /// Apply `schedule` to the worker thread before `setup`.
    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Spawn the worker and wait until its schedule and `setup` have completed.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero interval, an interval beyond `i64::MAX` nanoseconds, a
    /// name containing NUL, or when already running; otherwise whatever scheduling or `setup`
    /// returned on the worker.
    pub fn start<T: PeriodicTask>(&mut self, mut task: T) -> RtResult<()> {
        if self.interval.is_zero() {
            return Err(RtError::invalid("period must be non-zero"));
        }
        interval_nanos(self.interval)?;
        if self.name.contains('\0') {
            return Err(RtError::invalid("thread name contains NUL"));
        }
        if self.handle.is_some() {
            return Err(RtError::invalid("thread already running"));
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }

        let (ready_tx, ready_rx) = sync_channel::<RtResult<()>>(1);
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let schedule = self.schedule.clone();
        let interval = self.interval;
        running.store(true, Ordering::Release);

        let handle = std::thread::Builder::new()
            .name(self.name.as_str().to_owned())
            .spawn(move || {
                let _running = RunningGuard(&running);
                let startup = schedule
                    .as_ref()
                    .map_or(Ok(()), |s| sched::apply(ThreadHandle::current(), s))
                    .and_then(|()| task.setup());
                let failed = startup.is_err();
                let _ = ready_tx.send(startup);
                if failed {
                    return Ok(());
                }

                let result = run_loop(&mut task, interval, &running, &counters);
                task.teardown();
                result
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                RtError::from_io("pthread_create", &e)
            })?;

        let startup = ready_rx.recv().unwrap_or(Err(RtError::SystemFailure {
            call: "thread start",
            errno: Errno::UnknownErrno,
        }));
        if let Err(e) = startup {
            self.running.store(false, Ordering::Release);
            let _ = handle.join();
            warn!(thread = %self.name, error = %e, "periodic thread failed to start");
            return Err(e);
        }

        info!(thread = %self.name, interval_us = self.interval.as_micros() as u64, "periodic thread started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Ask the worker to finish its current cycle, run `teardown` and exit; wait for it.
    ///
    /// Returns the error that ended the loop, if any. Calling it on a stopped thread is a
    /// no-op.
    pub fn stop(&mut self) -> RtResult<()> {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = handle.join().unwrap_or(Err(RtError::SystemFailure {
            call: "thread join",
            errno: Errno::UnknownErrno,
        }));
        debug!(
            thread = %self.name,
            cycles = self.cycles(),
            overruns = self.overruns(),
            "periodic thread stopped"
        );
        result
    }

    /// True between a successful `start` and the end of the loop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed `process` calls.
    pub fn cycles(&self) -> u64 {
        self.counters.cycles.load(Ordering::Relaxed)
    }

    /// Cycles that ended after the next deadline had already passed.
    pub fn overruns(&self) -> u64 {
        self.counters.overruns.load(Ordering::Relaxed)
    }
}

impl Drop for PeriodicThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_loop<T: PeriodicTask>(
    task: &mut T,
    interval: Duration,
    running: &AtomicBool,
    counters: &Counters,
) -> RtResult<()> {
    let mut pacer = Pacer::start(interval)?;
    let result = loop {
        if !running.load(Ordering::Acquire) {
            break Ok(());
        }
        if let Err(e) = task.process() {
            break Err(e);
        }
        counters.cycles.fetch_add(1, Ordering::Relaxed);
        match pacer.wait_next() {
            Ok(true) => {
                counters.overruns.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => break Err(e),
        }
    };
    result
}

/// Clears the running flag when the worker exits, including by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn interval_nanos(interval: Duration) -> RtResult<i64> {
    i64::try_from(interval.as_nanos()).map_err(|_| RtError::invalid("period too long"))
}

#[cfg(target_os = "linux")]
struct Pacer {
    next: nix::sys::time::TimeSpec,
    interval_ns: i64,
}

#[cfg(target_os = "linux")]
impl Pacer {
    const CLOCK: nix::time::ClockId = nix::time::ClockId::CLOCK_MONOTONIC;

    fn start(interval: Duration) -> RtResult<Self> {
        let now = nix::time::clock_gettime(Self::CLOCK)
            .map_err(|e| RtError::from_errno("clock_gettime", e))?;
        Ok(Self {
            next: now,
            interval_ns: interval_nanos(interval)?,
        })
    }

    /// Sleep until the next deadline. Returns true if it had already passed.
    fn wait_next(&mut self) -> RtResult<bool> {
        use nix::time::{ClockNanosleepFlags, clock_gettime, clock_nanosleep};

        self.next = timespec_add_ns(self.next, self.interval_ns)
            .ok_or(RtError::invalid("deadline exceeds the clock range"))?;
        let now = clock_gettime(Self::CLOCK).map_err(|e| RtError::from_errno("clock_gettime", e))?;
        if timespec_diff_ns(&now, &self.next) > 0 {
            // Skip missed periods instead of bursting to catch up.
            self.next = now;
            return Ok(true);
        }
        loop {
            match clock_nanosleep(Self::CLOCK, ClockNanosleepFlags::TIMER_ABSTIME, &self.next) {
                Ok(_) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(RtError::from_errno("clock_nanosleep", e)),
            }
        }
    }
}

#[cfg(target_os = "linux")]
const NANOS_PER_SEC: i128 = 1_000_000_000;

/// `None` when the result does not fit in `time_t`.
#[cfg(target_os = "linux")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> Option<nix::sys::time::TimeSpec> {
    let total = i128::from(ts.tv_nsec()) + i128::from(ns);
    let secs = i128::from(ts.tv_sec()) + total.div_euclid(NANOS_PER_SEC);
    let nanos = total.rem_euclid(NANOS_PER_SEC);
    let secs = libc::time_t::try_from(secs).ok()?;
    Some(nix::sys::time::TimeSpec::new(secs, nanos as _))
}

#[cfg(target_os = "linux")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i128 {
    (i128::from(a.tv_sec()) - i128::from(b.tv_sec())) * NANOS_PER_SEC
        + (i128::from(a.tv_nsec()) - i128::from(b.tv_nsec()))
}

#[cfg(not(target_os = "linux"))]
struct Pacer {
    next: std::time::Instant,
    interval: Duration,
}

#[cfg(not(target_os = "linux"))]
impl Pacer {
    fn start(interval: Duration) -> RtResult<Self> {
        Ok(Self {
            next: std::time::Instant::now(),
            interval,
        })
    }

    fn wait_next(&mut self) -> RtResult<bool> {
        self.next = self
            .next
            .checked_add(self.interval)
            .ok_or(RtError::invalid("deadline exceeds the clock range"))?;
        let now = std::time::Instant::now();
        match self.next.checked_duration_since(now) {
            Some(remaining) => {
                std::thread::sleep(remaining);
                Ok(false)
            }
            None => {
                self.next = now;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Calls {
        setup: AtomicUsize,
        process: AtomicUsize,
        teardown: AtomicUsize,
    }

    struct Counting {
        calls: Arc<Calls>,
        fail_after: Option<usize>,
    }

    impl PeriodicTask for Counting {
        fn setup(&mut self) -> RtResult<()> {
            self.calls.setup.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn process(&mut self) -> RtResult<()> {
            let n = self.calls.process.fetch_add(1, Ordering::Relaxed) + 1;
            match self.fail_after {
                Some(limit) if n >= limit => Err(RtError::Overflow),
                _ => Ok(()),
            }
        }

        fn teardown(&mut self) {
            self.calls.teardown.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn runs_setup_process_teardown() {
        let calls = Arc::new(Calls::default());
        let mut thread = PeriodicThread::new("rt-test", Duration::from_millis(1));
        thread
            .start(Counting {
                calls: Arc::clone(&calls),
                fail_after: None,
            })
            .unwrap();
        assert!(thread.is_running());
        std::thread::sleep(Duration::from_millis(50));
        thread.stop().unwrap();

        assert!(!thread.is_running());
        assert_eq!(calls.setup.load(Ordering::Relaxed), 1);
        assert_eq!(calls.teardown.load(Ordering::Relaxed), 1);
        let processed = calls.process.load(Ordering::Relaxed);
        assert!(processed >= 5, "only {processed} cycles");
        assert_eq!(thread.cycles(), processed as u64);
    }

    #[test]
    fn process_error_ends_loop() {
        let calls = Arc::new(Calls::default());
        let mut thread = PeriodicThread::new("rt-fail", Duration::from_millis(1));
        thread
            .start(Counting {
                calls: Arc::clone(&calls),
                fail_after: Some(3),
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!thread.is_running());
        assert_eq!(thread.stop(), Err(RtError::Overflow));
        assert_eq!(calls.process.load(Ordering::Relaxed), 3);
        assert_eq!(calls.teardown.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rejects_bad_configuration() {
        let calls = Arc::new(Calls::default());
        let mut zero = PeriodicThread::new("rt-zero", Duration::ZERO);
        assert!(zero
            .start(Counting {
                calls: Arc::clone(&calls),
                fail_after: None,
            })
            .is_err());

        let mut bad_prio = PeriodicThread::new("rt-prio", Duration::from_millis(1))
            .with_schedule(ScheduleConfig::fifo(0));
        let err = bad_prio
            .start(Counting {
                calls: Arc::clone(&calls),
                fail_after: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), rtcore::error::ErrorKind::InvalidArgument);
        assert_eq!(calls.setup.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn long_names_are_truncated() {
        let thread = PeriodicThread::new(&"n".repeat(64), Duration::from_millis(5));
        assert_eq!(thread.name().len(), 32);
        assert_eq!(thread.interval(), Duration::from_millis(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timespec_arithmetic_normalizes() {
        let ts = nix::sys::time::TimeSpec::new(1, 999_999_999);
        let next = timespec_add_ns(ts, 2).unwrap();
        assert_eq!(next.tv_sec(), 2);
        assert_eq!(next.tv_nsec(), 1);
        assert_eq!(timespec_diff_ns(&next, &ts), 2);

        let far = nix::sys::time::TimeSpec::new(libc::time_t::MAX, 0);
        assert!(timespec_add_ns(far, i64::MAX).is_none());
        assert!(timespec_add_ns(far, -1).is_some());
    }

    #[test]
    fn unrepresentable_period_is_rejected() {
        let calls = Arc::new(Calls::default());
        let mut thread = PeriodicThread::new("rt-huge", Duration::MAX);
        let err = thread
            .start(Counting {
                calls: Arc::clone(&calls),
                fail_after: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), rtcore::error::ErrorKind::InvalidArgument);
        assert!(!thread.is_running());
        assert_eq!(calls.setup.load(Ordering::Relaxed), 0);
        assert_eq!(thread.stop(), Ok(()));
    }

    #[test]
    fn name_with_nul_is_rejected() {
        let mut thread = PeriodicThread::new("rt\0bad", Duration::from_millis(1));
        let err = thread
            .start(Counting {
                calls: Arc::new(Calls::default()),
                fail_after: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), rtcore::error::ErrorKind::InvalidArgument);
        assert!(!thread.is_running());
    }

    struct Panicking;

    impl PeriodicTask for Panicking {
        fn process(&mut self) -> RtResult<()> {
            panic!("task failed");
        }
    }

    #[test]
    fn panicking_task_clears_running() {
        let mut thread = PeriodicThread::new("rt-panic", Duration::from_millis(1));
        thread.start(Panicking).unwrap();
        for _ in 0..500 {
            if !thread.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!thread.is_running());
        let err = thread.stop().unwrap_err();
        assert_eq!(err.kind(), rtcore::error::ErrorKind::SystemFailure);
    }
}
