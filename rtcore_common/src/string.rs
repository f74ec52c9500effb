//! Fixed-capacity, heap-free string.
//!
//! [`BoundedString`] is the name/identifier type used throughout the workspace wherever a string
//! must be carried through a real-time path: shared memory names, error context, thread names.
//! It never allocates, is `Copy`, and is valid when all of its bytes are zero, so it can also
//! live inside a shared memory segment.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use core::str;

/// Inline UTF-8 string holding at most `N` bytes.
///
/// # Overflow policy
///
/// Overlong input is truncated, never rejected. The stored value is the longest prefix of the
/// source that fits in the remaining capacity and ends on a character boundary. Every
/// constructor and append path applies this same rule, so the result for a given input is
/// always the same.
///
/// ```
/// use rtcore_common::string::BoundedString;
///
/// let name = BoundedString::<4>::from("sensor");
/// assert_eq!(name, "sens");
/// assert_eq!(name.len(), 4);
/// ```
#[derive(Clone, Copy)]
#[repr(C)]
pub struct BoundedString<const N: usize> {
    len: usize,
    buf: [u8; N],
}

impl<const N: usize> BoundedString<N> {
    const NON_ZERO: () = assert!(N > 0, "BoundedString capacity must be non-zero");

    /// Create an empty string.
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_ZERO;
        Self { len: 0, buf: [0; N] }
    }

    /// Maximum number of bytes the string can hold.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Current length in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        if self.len > N { N } else { self.len }
    }

    /// True if the string holds no bytes.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the string is at capacity.
    #[inline]
    pub const fn is_full(&self) -> bool {
        self.len() == N
    }

    /// Bytes still available before the string is full.
    #[inline]
    pub const fn remaining(&self) -> usize {
        N - self.len()
    }

    /// View the contents as `&str`.
    pub fn as_str(&self) -> &str {
        let bytes = &self.buf[..self.len()];
        match str::from_utf8(bytes) {
            Ok(s) => s,
            // Only reachable when the bytes were written by another process through shared
            // memory; expose the valid prefix.
            Err(e) => str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
        }
    }

    /// View the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    /// Append as much of `s` as fits, returning the number of bytes appended.
    pub fn push_str(&mut self, s: &str) -> usize {
        let take = floor_char_boundary(s, self.remaining());
        let start = self.len();
        self.buf[start..start + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len = start + take;
        take
    }

    /// Append a single character. Returns `false` if it did not fit.
    pub fn push(&mut self, c: char) -> bool {
        let mut tmp = [0u8; 4];
        let encoded = c.encode_utf8(&mut tmp);
        self.push_str(encoded) == encoded.len()
    }

    /// Replace the contents with as much of `s` as fits.
    pub fn set(&mut self, s: &str) -> usize {
        self.clear();
        self.push_str(s)
    }

    /// Remove all contents.
    pub fn clear(&mut self) {
        self.buf = [0; N];
        self.len = 0;
    }
}

/// Largest index `<= max` that lies on a character boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

impl<const N: usize> Default for BoundedString<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> From<&str> for BoundedString<N> {
    fn from(s: &str) -> Self {
        let mut out = Self::new();
        out.push_str(s);
        out
    }
}

impl<const N: usize> Deref for BoundedString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> AsRef<str> for BoundedString<N> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> fmt::Write for BoundedString<N> {
    /// Truncating write: never fails, silently drops what does not fit.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> fmt::Debug for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize, const M: usize> PartialEq<BoundedString<M>> for BoundedString<N> {
    fn eq(&self, other: &BoundedString<M>) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const N: usize> Eq for BoundedString<N> {}

impl<const N: usize> PartialEq<str> for BoundedString<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for BoundedString<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<const N: usize> PartialOrd for BoundedString<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> Ord for BoundedString<N> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl<const N: usize> Hash for BoundedString<N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}
