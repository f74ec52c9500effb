//! # rtcore Real-Time Primitives
//!
//! Building blocks for low-latency programs that share data between threads and processes
//! without taking the allocator or the kernel into the hot path.
//!
//! ## Modules
//!
//! - [`ring`] - single-producer/single-consumer ring buffer
//! - [`mpsc`] - bounded lock-free multi-producer/single-consumer queue
//! - [`frame`] - multi-producer FIFO of fixed-size byte frames, accessed in place
//! - [`layout`] - `ShmSafe`/`ShmShared` markers, cache-line padding and segment offset allocation
//! - [`segment`] - named POSIX shared memory segments
//! - [`sync`] - futex-backed mutex and condition variable usable across processes
//! - `pi` - priority-inheriting mutex for threads of one process (Linux)
//! - [`sched`] - thread scheduling policy, CPU affinity and memory locking
//! - [`thread`] - periodic worker threads with absolute-time pacing
//! - [`platform`] - futex and CPU queries for the host OS
//!
//! ## Sharing a queue between processes
//!
//! ```rust,no_run
//! use rtcore_realtime::layout::SegmentLayout;
//! use rtcore_realtime::mpsc::BoundedMpscQueue;
//! use rtcore_realtime::segment::SharedMemorySegment;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! type Events = BoundedMpscQueue<u64, 256>;
//!
//! let mut layout = SegmentLayout::new();
//! let queue_at = layout.add::<Events>()?;
//! let segment = SharedMemorySegment::create("/rtcore_events", layout.finish())?;
//!
//! // A fresh segment is zero-filled, which is an empty queue.
//! let queue: &Events = segment.place(queue_at)?;
//! queue.try_enqueue(42)?;
//! # Ok(())
//! # }
//! ```
//!
//! Hot-path operations (push, pop, enqueue, dequeue, uncontended lock) never allocate, never
//! log and never enter the kernel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod layout;
pub mod mpsc;
pub mod platform;
#[cfg(target_os = "linux")]
pub mod pi;
pub mod ring;
pub mod sched;
pub mod segment;
pub mod sync;
pub mod thread;

pub use frame::FrameBuffer;
pub use layout::{CachePadded, SegmentLayout, ShmSafe, ShmShared};
pub use mpsc::BoundedMpscQueue;
#[cfg(target_os = "linux")]
pub use pi::{PiMutex, PiMutexGuard};
pub use ring::RingBuffer;
pub use rtcore::error::{Empty, ErrorKind, Full, Overflow, RtError, RtResult};
pub use rtcore::schedule::{SchedPolicy, ScheduleConfig};
pub use rtcore::string::BoundedString;
pub use sched::{ThreadHandle, apply, current_schedule, lock_memory, unlock_memory};
pub use segment::{Access, SharedMemorySegment};
pub use sync::{ProcessCondvar, ProcessMutex, ProcessMutexGuard, RawProcessMutex};
pub use thread::{PeriodicTask, PeriodicThread};

/// Install a global `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
