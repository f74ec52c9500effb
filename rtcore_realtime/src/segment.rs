//! Named POSIX shared memory segments.
//!
//! A [`SharedMemorySegment`] is either the *creator* of a named object (it ran `shm_open` with
//! `O_CREAT | O_EXCL`) or an *opener* of an existing one. Both unmap on drop; only the creator
//! also unlinks the name, after which new `open` calls fail with `NotFound` while existing
//! mappings in other processes stay valid until they are dropped.
//!
//! The mapping's base address differs between processes. Records are located by byte offset
//! (see [`SegmentLayout`](crate::layout::SegmentLayout)). Records referenced in place must
//! implement [`ShmShared`](crate::layout::ShmShared); plain data is copied with
//! [`SharedMemorySegment::read_at`] and [`SharedMemorySegment::write_at`].

use crate::layout::ShmShared;
use core::ptr::NonNull;
use memmap2::{Mmap, MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use rtcore::consts::{SEGMENT_ALIGNMENT, SHM_MAX_SIZE, SHM_NAME_MAX};
use rtcore::error::{Errno, RtError, RtResult};
use rtcore::string::BoundedString;
use std::fs::File;
use tracing::{debug, info, warn};

/// Normalized segment name: a leading `/` followed by the caller's name.
pub type SegmentName = BoundedString<SHM_NAME_MAX>;

/// Mapping mode for [`SharedMemorySegment::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// Map for reading only; writes through the mapping fault.
    ReadOnly,
    /// Map for reading and writing.
    #[default]
    ReadWrite,
}

// Held only so the region is unmapped on drop.
#[allow(dead_code)]
enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// A mapped named shared memory object.
pub struct SharedMemorySegment {
    name: SegmentName,
    _mapping: Mapping,
    base: NonNull<u8>,
    len: usize,
    access: Access,
    creator: bool,
}

// The mapping is plain shared memory; shared access goes through `ShmShared` records.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl SharedMemorySegment {
    /// Create a new named segment of `size` bytes, zero-filled.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if an object with this name exists (exactly one of several racing
    ///   creators succeeds)
    /// - `InvalidArgument` for a malformed name or a size of 0 or above the maximum
    /// - `PermissionDenied` / `SystemFailure` from the OS
    pub fn create(name: &str, size: usize) -> RtResult<Self> {
        let name = normalize_name(name)?;
        if size == 0 || size > SHM_MAX_SIZE {
            return Err(RtError::invalid("segment size out of range"));
        }

        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o660),
        )
        .map_err(|e| map_shm_errno("shm_open", &name, e))?;
        let file = File::from(fd);

        // From here on the name is ours; unlink it again if setup fails.
        let mapping = file
            .set_len(size as u64)
            .map_err(|e| RtError::from_io("ftruncate", &e))
            .and_then(|()| {
                // SAFETY: the object was just created and is only resized through this handle.
                unsafe { MmapOptions::new().len(size).map_mut(&file) }
                    .map_err(|e| RtError::from_io("mmap", &e))
            });
        let mut mapping = match mapping {
            Ok(m) => m,
            Err(e) => {
                let _ = shm_unlink(name.as_str());
                return Err(e);
            }
        };

        let base = NonNull::new(mapping.as_mut_ptr()).ok_or(RtError::SystemFailure {
            call: "mmap",
            errno: Errno::EFAULT,
        })?;
        let segment = Self {
            name,
            _mapping: Mapping::ReadWrite(mapping),
            base,
            len: size,
            access: Access::ReadWrite,
            creator: true,
        };
        validate_memory_alignment(segment.base.as_ptr() as usize)?;

        info!(name = %segment.name, size, "created shared memory segment");
        Ok(segment)
    }

    /// Map an existing segment. Its size is read from the OS object.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no object with this name exists
    /// - `InvalidArgument` for a malformed name or an object of size 0
    /// - `PermissionDenied` / `SystemFailure` from the OS
    pub fn open(name: &str, access: Access) -> RtResult<Self> {
        let name = normalize_name(name)?;
        let flags = match access {
            Access::ReadOnly => OFlag::O_RDONLY,
            Access::ReadWrite => OFlag::O_RDWR,
        };
        let fd = shm_open(name.as_str(), flags, Mode::empty())
            .map_err(|e| map_shm_errno("shm_open", &name, e))?;
        let file = File::from(fd);

        let len = file
            .metadata()
            .map_err(|e| RtError::from_io("fstat", &e))?
            .len() as usize;
        if len == 0 {
            return Err(RtError::invalid("shared memory object has zero size"));
        }

        // SAFETY: the object stays mapped for the lifetime of `Self`; its size is fixed at
        // creation.
        let (mapping, base) = match access {
            Access::ReadWrite => {
                let mut m = unsafe { MmapOptions::new().len(len).map_mut(&file) }
                    .map_err(|e| RtError::from_io("mmap", &e))?;
                let base = m.as_mut_ptr();
                (Mapping::ReadWrite(m), base)
            }
            Access::ReadOnly => {
                let m = unsafe { MmapOptions::new().len(len).map(&file) }
                    .map_err(|e| RtError::from_io("mmap", &e))?;
                let base = m.as_ptr().cast_mut();
                (Mapping::ReadOnly(m), base)
            }
        };
        let base = NonNull::new(base).ok_or(RtError::SystemFailure {
            call: "mmap",
            errno: Errno::EFAULT,
        })?;
        validate_memory_alignment(base.as_ptr() as usize)?;

        debug!(name = %name, len, ?access, "opened shared memory segment");
        Ok(Self {
            name,
            _mapping: mapping,
            base,
            len,
            access,
            creator: false,
        })
    }

    /// True if a segment with this name currently exists.
    pub fn exists(name: &str) -> bool {
        let Ok(name) = normalize_name(name) else {
            return false;
        };
        match shm_open(name.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(_fd) => true,
            Err(Errno::ENOENT) => false,
            // Present but not readable by us.
            Err(_) => true,
        }
    }

    /// Unlink a segment by name, regardless of who created it.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such segment exists.
    pub fn remove(name: &str) -> RtResult<()> {
        let name = normalize_name(name)?;
        shm_unlink(name.as_str()).map_err(|e| map_shm_errno("shm_unlink", &name, e))?;
        debug!(name = %name, "unlinked shared memory segment");
        Ok(())
    }

    /// Normalized name, with leading `/`.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Mapped size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Segments always have a non-zero size.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for the process that created the OS object.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Mapping mode.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Base of the mapped region, aligned to [`SEGMENT_ALIGNMENT`].
    ///
    /// The address is local to this process and must never be stored inside the segment.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Reference a `T` stored at `offset`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the record does not fit or `offset` is misaligned for `T`;
    /// `PermissionDenied` on a read-only mapping.
    ///
    /// Only interior-mutable records can be placed, since other mappings may change the bytes
    /// at any time:
    ///
    /// ```compile_fail
    /// # use rtcore_realtime::SharedMemorySegment;
    /// # fn f(segment: &SharedMemorySegment) {
    /// let bytes: &[u8; 4] = segment.place(0).unwrap();
    /// # }
    /// ```
    pub fn place<T: ShmShared>(&self, offset: usize) -> RtResult<&T> {
        if self.access != Access::ReadWrite {
            return Err(RtError::PermissionDenied {
                operation: "place on read-only segment",
            });
        }
        self.check_range(offset, core::mem::size_of::<T>())?;
        let addr = self.base.as_ptr() as usize + offset;
        if addr % core::mem::align_of::<T>() != 0 {
            return Err(RtError::invalid("offset misaligned for record type"));
        }
        // SAFETY: in bounds and aligned. `ShmShared` guarantees any bytes in the segment
        // (zero or written through T's own API) form a valid `T` that tolerates concurrent
        // mutation behind `&T`.
        Ok(unsafe { &*(addr as *const T) })
    }

    /// Copy `data` into the segment at `offset`.
    ///
    /// Takes `&mut self` so no record placed through this mapping is alive during the copy.
    /// Writers in other mappings are not excluded; coordinate them through a placed lock.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> RtResult<()> {
        if self.access != Access::ReadWrite {
            return Err(RtError::PermissionDenied {
                operation: "write to read-only segment",
            });
        }
        self.check_range(offset, data.len())?;
        // SAFETY: range checked; the mapping is writable.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes at `offset` into `buf`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> RtResult<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: range checked.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, size: usize) -> RtResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RtError::invalid("range exceeds segment size")),
        }
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        if self.creator {
            match shm_unlink(self.name.as_str()) {
                Ok(()) => debug!(name = %self.name, "unlinked shared memory segment"),
                // Already removed by someone else.
                Err(Errno::ENOENT) => {}
                Err(e) => warn!(name = %self.name, error = %e, "shm_unlink failed"),
            }
        }
    }
}

impl core::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("access", &self.access)
            .field("creator", &self.creator)
            .finish()
    }
}

/// Validate a segment name and prefix it with `/`.
///
/// Accepted: 1..=254 characters (plus an optional leading `/`), no further `/`, no NUL.
pub fn normalize_name(name: &str) -> RtResult<SegmentName> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() {
        return Err(RtError::invalid("shared memory name is empty"));
    }
    if bare.len() + 1 > SHM_NAME_MAX {
        return Err(RtError::invalid("shared memory name too long"));
    }
    if bare.contains(['/', '\0']) {
        return Err(RtError::invalid("shared memory name contains '/' or NUL"));
    }
    let mut out = SegmentName::new();
    out.push('/');
    out.push_str(bare);
    Ok(out)
}

/// Check a mapping address against [`SEGMENT_ALIGNMENT`].
pub fn validate_memory_alignment(address: usize) -> RtResult<()> {
    if address % SEGMENT_ALIGNMENT != 0 {
        return Err(RtError::invalid("mapping not aligned to a cache line"));
    }
    Ok(())
}

fn map_shm_errno(call: &'static str, name: &SegmentName, errno: Errno) -> RtError {
    match errno {
        Errno::EEXIST => RtError::already_exists(name),
        Errno::ENOENT => RtError::not_found(name),
        Errno::ENAMETOOLONG => RtError::invalid("shared memory name too long"),
        other => RtError::from_errno(call, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
    use rtcore::error::ErrorKind;

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("cam0").unwrap(), "/cam0");
        assert_eq!(normalize_name("/cam0").unwrap(), "/cam0");
        for bad in ["", "/", "a/b", "//x", "nul\0"] {
            assert_eq!(
                normalize_name(bad).unwrap_err().kind(),
                ErrorKind::InvalidArgument,
                "{bad:?}"
            );
        }
        assert!(normalize_name(&"n".repeat(SHM_NAME_MAX - 1)).is_ok());
        assert!(normalize_name(&"n".repeat(SHM_NAME_MAX)).is_err());
    }

    #[test]
    fn errno_mapping_uses_name() {
        let name = normalize_name("seg").unwrap();
        assert_eq!(
            map_shm_errno("shm_open", &name, Errno::EEXIST),
            RtError::already_exists("/seg")
        );
        assert_eq!(
            map_shm_errno("shm_open", &name, Errno::ENOENT).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            map_shm_errno("shm_open", &name, Errno::EACCES).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            map_shm_errno("shm_open", &name, Errno::EMFILE).kind(),
            ErrorKind::SystemFailure
        );
    }

    #[test]
    fn alignment_check() {
        assert!(validate_memory_alignment(0x1000).is_ok());
        assert!(validate_memory_alignment(0x1008).is_err());
    }

    #[test]
    fn size_limits() {
        let name = format!("rtcore_unit_size_{}", std::process::id());
        assert_eq!(
            SharedMemorySegment::create(&name, 0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            SharedMemorySegment::create(&name, SHM_MAX_SIZE + 1)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert!(!SharedMemorySegment::exists(&name));
    }

    #[test]
    fn bounds_are_checked() {
        let name = format!("rtcore_unit_bounds_{}", std::process::id());
        let mut seg = SharedMemorySegment::create(&name, 4096).unwrap();
        assert!(seg.write_at(4090, &[0u8; 6]).is_ok());
        assert!(seg.write_at(4091, &[0u8; 6]).is_err());
        assert!(seg.write_at(usize::MAX, &[0u8; 1]).is_err());
        assert!(seg.place::<AtomicU64>(4088).is_ok());
        assert!(seg.place::<AtomicU64>(4089).is_err());
        assert!(seg.place::<[AtomicU8; 4097]>(0).is_err());
    }

    #[test]
    fn byte_io_and_placed_records_share_storage() {
        let name = format!("rtcore_unit_place_{}", std::process::id());
        let mut seg = SharedMemorySegment::create(&name, 4096).unwrap();
        seg.write_at(64, &7u64.to_ne_bytes()).unwrap();

        let counter: &AtomicU64 = seg.place(64).unwrap();
        assert_eq!(counter.fetch_add(1, Ordering::Relaxed), 7);

        let mut raw = [0u8; 8];
        seg.read_at(64, &mut raw).unwrap();
        assert_eq!(u64::from_ne_bytes(raw), 8);
    }
}
