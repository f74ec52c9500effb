//! Producer/consumer signalling across processes through a futex in shared memory.
//!
//! Run in two terminals:
//!
//! ```text
//! cargo run -p rtcore_realtime --example shm_futex -- produce
//! cargo run -p rtcore_realtime --example shm_futex -- consume
//! ```

use clap::{Parser, ValueEnum};
use nix::time::{ClockId, clock_gettime};
use rtcore_realtime::platform::{futex_wait, futex_wake};
use rtcore_realtime::{
    Access, ErrorKind, RtError, RtResult, SharedMemorySegment, ShmSafe, ShmShared,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const SHM_NAME: &str = "/rtcore_shm_futex_example";
const POST_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Produce,
    Consume,
}

#[derive(Parser, Debug)]
#[command(about = "Futex signalling through a shared memory segment")]
struct Args {
    mode: Mode,
}

/// Flat record shared by both processes.
#[repr(C)]
struct Signal {
    /// Futex word, bumped on every post.
    seq: AtomicU32,
    /// Monotonic timestamp of the last post.
    nanos: AtomicI64,
}

// SAFETY: atomics only, repr(C), all-zero is the initial state.
unsafe impl ShmSafe for Signal {}
unsafe impl ShmShared for Signal {}

impl Signal {
    fn post(&self) -> RtResult<()> {
        self.nanos.store(now_nanos()?, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, u32::MAX)?;
        Ok(())
    }

    /// Wait for a post after `seen`. Returns the new sequence, or `None` on timeout.
    fn wait(&self, seen: u32, timeout: Duration) -> RtResult<Option<u32>> {
        match futex_wait(&self.seq, seen, Some(timeout)) {
            Ok(()) | Err(RtError::Timeout) => {}
            Err(e) => return Err(e),
        }
        let seq = self.seq.load(Ordering::Acquire);
        Ok((seq != seen).then_some(seq))
    }
}

fn now_nanos() -> RtResult<i64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map_err(|e| RtError::from_errno("clock_gettime", e))?;
    Ok(ts.tv_sec() as i64 * 1_000_000_000 + ts.tv_nsec() as i64)
}

fn attach() -> RtResult<SharedMemorySegment> {
    match SharedMemorySegment::create(SHM_NAME, size_of::<Signal>()) {
        Ok(segment) => Ok(segment),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            SharedMemorySegment::open(SHM_NAME, Access::ReadWrite)
        }
        Err(e) => Err(e),
    }
}

fn produce(exit: &AtomicBool) -> RtResult<()> {
    let segment = attach()?;
    let signal: &Signal = segment.place(0)?;
    while !exit.load(Ordering::Relaxed) {
        signal.post()?;
        info!(seq = signal.seq.load(Ordering::Relaxed), "posted");
        std::thread::sleep(POST_INTERVAL);
    }
    if let Err(e) = SharedMemorySegment::remove(SHM_NAME) {
        warn!(error = %e, "segment already removed");
    }
    Ok(())
}

fn consume(exit: &AtomicBool) -> RtResult<()> {
    let segment = attach()?;
    let signal: &Signal = segment.place(0)?;
    let mut seen = signal.seq.load(Ordering::Acquire);
    while !exit.load(Ordering::Relaxed) {
        if let Some(seq) = signal.wait(seen, WAIT_TIMEOUT)? {
            seen = seq;
            let latency = now_nanos()? - signal.nanos.load(Ordering::Relaxed);
            info!(seq, latency_ns = latency, "received");
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    rtcore_realtime::init_tracing();
    let args = Args::parse();

    let exit = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exit);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))?;

    info!(mode = ?args.mode, "press Ctrl-C to exit");
    match args.mode {
        Mode::Produce => produce(&exit)?,
        Mode::Consume => consume(&exit)?,
    }
    Ok(())
}
