//! rtcore Common Library
//!
//! Shared vocabulary for the rtcore workspace: the error type, heap-free strings, scheduling
//! requests, constants and configuration loading.
//!
//! # Module Structure
//!
//! - [`error`] - `RtError`, `ErrorKind` and the hot-path queue errors
//! - [`string`] - `BoundedString`, the fixed-capacity string
//! - [`schedule`] - `ScheduleConfig` and `SchedPolicy`
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Numeric limits
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! rtcore = { package = "rtcore_common", path = "../rtcore_common" }
//! ```

pub mod config;
pub mod consts;
pub mod error;
pub mod prelude;
pub mod schedule;
pub mod string;
