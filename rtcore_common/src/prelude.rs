//! Prelude module for common re-exports.
//!
//! ```rust
//! use rtcore_common::prelude::*;
//! ```

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{Empty, ErrorKind, Full, Overflow, RtError, RtResult};

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, RunnerConfig, SharedConfig};

// ─── Scheduling ─────────────────────────────────────────────────────
pub use crate::schedule::{CpuList, SchedPolicy, ScheduleConfig};

// ─── Strings & Constants ────────────────────────────────────────────
pub use crate::consts::{CACHE_LINE_SIZE, SHM_NAME_MAX};
pub use crate::string::BoundedString;
