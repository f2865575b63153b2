/// Named POSIX shared-memory object management.
///
/// Creates or opens the object behind one cache context and maps it
/// read-write, shared. The mapping is released when the region is
/// dropped; the object itself only goes away through [`unlink`].
use std::ffi::CStr;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::MmapMut;

use super::layout::{self, Geometry, HEADER_OFFSET, MAX_CAPACITY};
use crate::error::{Result, ShctxError};

/// A mapped session segment, owning the mmap and the descriptor.
pub struct ShmRegion {
    base: *mut u8,
    mmap: MmapMut,
    _file: File,
    capacity: u32,
}

impl ShmRegion {
    /// Create a fresh object of `capacity` slots, replacing any stale one
    /// left under the same name. The contents are zeroed but not formatted.
    pub fn create(name: &CStr, mode: u32, capacity: u32) -> Result<Self> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(ShctxError::BadArgs(format!(
                "capacity must be between 1 and {MAX_CAPACITY}, got {capacity}"
            )));
        }

        unlink_stale(name)?;

        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                mode as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(ShctxError::last_os("shm_open"));
        }
        // Safety: shm_open just handed us this descriptor.
        let file = unsafe { File::from_raw_fd(fd) };

        match Self::size_and_map(file, capacity) {
            Ok(region) => Ok(region),
            Err(e) => {
                // Leave nothing half-built behind.
                let _ = unlink(name);
                Err(e)
            }
        }
    }

    fn size_and_map(file: File, capacity: u32) -> Result<Self> {
        let size = layout::region_size(capacity);
        file.set_len(size as u64)
            .map_err(|e| ShctxError::io("ftruncate", e))?;

        // Safety: the object was created exclusively above and nobody else
        // has had a chance to open it.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| ShctxError::io("mmap", e))?;
        mmap.fill(0);

        Ok(ShmRegion {
            base: mmap.as_mut_ptr(),
            mmap,
            _file: file,
            capacity,
        })
    }

    /// Open an existing object without touching its contents.
    ///
    /// The slot count is derived from the object's byte size and checked
    /// against the geometry stamped by the creator.
    pub fn open(name: &CStr) -> Result<Self> {
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(ShctxError::last_os("shm_open"));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let size = file
            .metadata()
            .map_err(|e| ShctxError::io("fstat", e))?
            .len() as usize;
        let capacity = layout::capacity_for(size)
            .filter(|&c| c > 0)
            .ok_or_else(|| incompatible(name))?;

        // Safety: the object stays mapped for the lifetime of the region;
        // concurrent writers only touch it under the segment lock.
        let mut mmap =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| ShctxError::io("mmap", e))?;

        let region = ShmRegion {
            base: mmap.as_mut_ptr(),
            mmap,
            _file: file,
            capacity,
        };
        if !region.geometry().is_compatible(capacity) {
            return Err(incompatible(name));
        }
        Ok(region)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Immutable layout description written at creation time.
    pub fn geometry(&self) -> Geometry {
        debug_assert!(self.mmap.len() >= HEADER_OFFSET + std::mem::size_of::<Geometry>());
        unsafe { std::ptr::read(self.base.add(HEADER_OFFSET) as *const Geometry) }
    }

    /// Start of the mapping. Valid for as long as the region lives.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }
}

fn incompatible(name: &CStr) -> ShctxError {
    ShctxError::BadArgs(format!(
        "shared object {} was not created by a compatible build",
        name.to_string_lossy()
    ))
}

/// Remove the named object. Mappings that still exist stay valid.
pub fn unlink(name: &CStr) -> Result<()> {
    if unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
        return Err(ShctxError::last_os("shm_unlink"));
    }
    Ok(())
}

/// Remove a leftover object of the same name, if any.
fn unlink_stale(name: &CStr) -> Result<()> {
    match unlink(name) {
        Err(ShctxError::Syscall { source, .. })
            if source.raw_os_error() == Some(libc::ENOENT) =>
        {
            Ok(())
        }
        other => other,
    }
}
