//! Error vocabulary shared by every rtcore primitive.
//!
//! [`RtError`] is `Copy` and heap-free: object names are carried as [`ErrorName`]
//! (a [`BoundedString`]) and OS failures as a raw [`Errno`]. This keeps error values usable in
//! real-time paths where allocation is not allowed.
//!
//! The hot-path operations of the lock-free queues return the narrower [`Overflow`], [`Full`]
//! and [`Empty`] types instead, which hand a rejected item back to the caller. All of them
//! convert into [`RtError`].

use crate::consts::ERROR_NAME_MAX;
use crate::string::BoundedString;
use core::fmt;
pub use nix::errno::Errno;
use static_assertions::assert_impl_all;
use thiserror::Error;

/// Object name as carried inside an error (truncated to [`ERROR_NAME_MAX`] bytes).
pub type ErrorName = BoundedString<ERROR_NAME_MAX>;

/// Failure kinds, independent of the context data carried by [`RtError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bounded buffer full on push.
    Overflow,
    /// Bounded buffer or queue has nothing to take.
    Empty,
    /// Queue backpressure.
    Full,
    /// Bounded wait expired.
    Timeout,
    /// Named shared object does not exist.
    NotFound,
    /// Named shared object already created.
    AlreadyExists,
    /// Insufficient privilege.
    PermissionDenied,
    /// Out-of-range argument.
    InvalidArgument,
    /// Opaque OS error.
    SystemFailure,
}

/// Errors returned by rtcore operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtError {
    /// Bounded buffer full on push.
    #[error("buffer overflow")]
    Overflow,

    /// Nothing available to take.
    #[error("buffer empty")]
    Empty,

    /// Queue full, retry later.
    #[error("queue full")]
    Full,

    /// Bounded wait expired.
    #[error("timed out")]
    Timeout,

    /// Named shared object does not exist.
    #[error("shared object not found: {name}")]
    NotFound {
        /// Object name
        name: ErrorName,
    },

    /// Named shared object already exists.
    #[error("shared object already exists: {name}")]
    AlreadyExists {
        /// Object name
        name: ErrorName,
    },

    /// Caller lacks the privilege for the requested operation.
    #[error("permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was refused
        operation: &'static str,
    },

    /// Argument outside its valid range.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: &'static str,
    },

    /// Underlying OS call failed.
    #[error("{call} failed: {errno}")]
    SystemFailure {
        /// Failing system call or library function
        call: &'static str,
        /// Raw error code
        errno: Errno,
    },
}

impl RtError {
    /// `NotFound` for the given object name.
    pub fn not_found(name: &str) -> Self {
        Self::NotFound {
            name: ErrorName::from(name),
        }
    }

    /// `AlreadyExists` for the given object name.
    pub fn already_exists(name: &str) -> Self {
        Self::AlreadyExists {
            name: ErrorName::from(name),
        }
    }

    /// `InvalidArgument` with a static reason.
    pub const fn invalid(reason: &'static str) -> Self {
        Self::InvalidArgument { reason }
    }

    /// Classify an errno returned by `call`.
    ///
    /// Privilege and argument errors map to their own kinds, everything else is a
    /// `SystemFailure`. Name-related codes (`ENOENT`, `EEXIST`) are mapped by callers that know
    /// the object name.
    pub fn from_errno(call: &'static str, errno: Errno) -> Self {
        match errno {
            Errno::EPERM | Errno::EACCES => Self::PermissionDenied { operation: call },
            Errno::EINVAL => Self::InvalidArgument { reason: call },
            Errno::ETIMEDOUT => Self::Timeout,
            _ => Self::SystemFailure { call, errno },
        }
    }

    /// Classify an `io::Error` returned by `call`.
    pub fn from_io(call: &'static str, err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::from_errno(call, Errno::from_raw(code)),
            None => Self::SystemFailure {
                call,
                errno: Errno::UnknownErrno,
            },
        }
    }

    /// Kind of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Overflow => ErrorKind::Overflow,
            Self::Empty => ErrorKind::Empty,
            Self::Full => ErrorKind::Full,
            Self::Timeout => ErrorKind::Timeout,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::SystemFailure { .. } => ErrorKind::SystemFailure,
        }
    }

    /// Raw OS error code, for `SystemFailure` only.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SystemFailure { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }
}

/// Result type for rtcore operations
pub type RtResult<T> = Result<T, RtError>;

// Errors cross threads and stay usable where allocation is forbidden.
assert_impl_all!(RtError: Copy, Send, Sync, std::error::Error);

/// Push rejected because the ring buffer is full. Carries the rejected item.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Overflow<T>(pub T);

/// Enqueue rejected because the queue is full. Carries the rejected item.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

/// Nothing available to take.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("buffer empty")]
pub struct Empty;

impl<T> Overflow<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Full<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Overflow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Overflow(..)")
    }
}

impl<T> fmt::Display for Overflow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("buffer overflow")
    }
}

impl<T> std::error::Error for Overflow<T> {}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue full")
    }
}

impl<T> std::error::Error for Full<T> {}

impl<T> From<Overflow<T>> for RtError {
    fn from(_: Overflow<T>) -> Self {
        Self::Overflow
    }
}

impl<T> From<Full<T>> for RtError {
    fn from(_: Full<T>) -> Self {
        Self::Full
    }
}

impl From<Empty> for RtError {
    fn from(_: Empty) -> Self {
        Self::Empty
    }
}
