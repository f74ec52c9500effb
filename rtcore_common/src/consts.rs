//! System-wide constants for the rtcore workspace.
//!
//! Single source of truth for numeric limits. Imported by all crates. Their relations are
//! checked at compile time.

use static_assertions::const_assert;

/// Maximum length of a shared memory object name, including the leading `/`.
///
/// Mirrors `NAME_MAX` on Linux, which bounds the file name under `/dev/shm`.
pub const SHM_NAME_MAX: usize = 255;

/// Maximum shared memory segment size in bytes (1 GiB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// CPU cache line size in bytes.
///
/// Producer- and consumer-owned cursors are padded to this size to avoid false sharing.
pub const CACHE_LINE_SIZE: usize = 64;

/// Minimum alignment guaranteed for the base of a mapped segment.
pub const SEGMENT_ALIGNMENT: usize = CACHE_LINE_SIZE;

/// Capacity of the CPU affinity list in a [`ScheduleConfig`](crate::schedule::ScheduleConfig).
pub const MAX_CPUS: usize = 64;

/// Highest CPU index that can be expressed in an affinity mask.
pub const MAX_CPU_INDEX: usize = 1023;

/// Lowest priority of the Linux real-time scheduling classes.
pub const RT_PRIORITY_MIN: i32 = 1;

/// Highest priority of the Linux real-time scheduling classes.
pub const RT_PRIORITY_MAX: i32 = 99;

/// Capacity of the object names carried inside errors.
pub const ERROR_NAME_MAX: usize = 62;

const_assert!(SEGMENT_ALIGNMENT.is_power_of_two());
const_assert!(SEGMENT_ALIGNMENT >= CACHE_LINE_SIZE);
const_assert!(RT_PRIORITY_MIN < RT_PRIORITY_MAX);
const_assert!(MAX_CPUS <= MAX_CPU_INDEX + 1);
const_assert!(ERROR_NAME_MAX < SHM_NAME_MAX);
const_assert!(SHM_MAX_SIZE % SEGMENT_ALIGNMENT == 0);
