//! SharedMemorySegment - anonymous shared memory wrapper.
//!
//! Provides safe abstraction over memfd_create / shm_open and mmap.
//! All unsafe operations are encapsulated with bounds checking.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::error::SegmentError;
use crate::shm::SegmentHandle;

/// Strategy used to obtain an anonymous, transferable memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentBackend {
    /// `memfd_create(2)` with size seals applied after sizing.
    Modern,
    /// POSIX `shm_open(3)` under a unique name, unlinked right away.
    Legacy,
}

static DETECTED_BACKEND: OnceLock<SegmentBackend> = OnceLock::new();

/// Disambiguates legacy object names created by one process.
static LEGACY_COUNTER: AtomicU64 = AtomicU64::new(0);

impl SegmentBackend {
    /// Backend selected for this process. Probed once, then cached.
    pub fn detect() -> Self {
        *DETECTED_BACKEND.get_or_init(|| {
            let backend = Self::probe();
            tracing::debug!(backend = backend.name(), "Selected shared memory backend");
            backend
        })
    }

    fn probe() -> Self {
        match Self::Modern.allocate("shmlink-probe") {
            Ok(_) => Self::Modern,
            Err(reason) => {
                tracing::debug!(reason = %reason, "memfd_create unavailable, using shm_open");
                Self::Legacy
            }
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Modern => "memfd",
            Self::Legacy => "shm_open",
        }
    }

    /// Obtain a fresh, zero-length memory object.
    fn allocate(&self, name: &str) -> Result<OwnedFd, String> {
        match self {
            Self::Modern => memfd_create(name),
            Self::Legacy => shm_open_anonymous(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn memfd_create(name: &str) -> Result<OwnedFd, String> {
    let c_name = CString::new(name).map_err(|e| format!("Invalid name: {}", e))?;
    // SAFETY: c_name is a valid CString, flags are valid memfd flags
    let fd = unsafe {
        libc::memfd_create(
            c_name.as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(format!(
            "memfd_create failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: fd was just returned by memfd_create and is owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn memfd_create(_name: &str) -> Result<OwnedFd, String> {
    Err("memfd_create is not supported on this platform".to_string())
}

fn shm_open_anonymous() -> Result<OwnedFd, String> {
    let shm_name = format!(
        "/shmlink-{}-{}",
        std::process::id(),
        LEGACY_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let c_name = CString::new(shm_name.as_str()).map_err(|e| format!("Invalid name: {}", e))?;

    // SAFETY: c_name is a valid CString, flags are valid POSIX flags
    let fd = unsafe {
        libc::shm_open(
            c_name.as_ptr(),
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(format!("shm_open failed: {}", std::io::Error::last_os_error()));
    }

    // Drop the name so only descriptors reference the object.
    // SAFETY: c_name is a valid CString
    unsafe { libc::shm_unlink(c_name.as_ptr()) };

    // SAFETY: fd was just returned by shm_open and is owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Map `capacity` bytes of `fd` shared read/write.
fn map_shared(fd: RawFd, capacity: usize) -> std::io::Result<NonNull<u8>> {
    // SAFETY: fd is valid, capacity is non-zero, offset 0 is valid
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8)
        .ok_or_else(|| std::io::Error::other("mmap returned null but not MAP_FAILED"))
}

/// How this process came to hold the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOrigin {
    /// Allocated by this process; it owns the region's lifetime.
    Created,
    /// Mapped from a handle received from another endpoint.
    Opened,
}

/// A mapped, fixed-capacity shared memory region.
///
/// This struct owns its mapping and its descriptor and releases both on
/// [`close`](Self::close) or drop. Other processes' mappings of the same
/// region are unaffected. Concurrent writers are not arbitrated.
pub struct SharedMemorySegment {
    /// Diagnostic name.
    name: String,
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapping in bytes.
    capacity: usize,
    /// Descriptor of the memory object; `None` once closed.
    fd: Option<OwnedFd>,
    /// How the region was allocated; unknown for received regions.
    backend: Option<SegmentBackend>,
    origin: SegmentOrigin,
}

// SAFETY: SharedMemorySegment owns its mapping and descriptor.
unsafe impl Send for SharedMemorySegment {}

// SAFETY: shared access only performs bounded raw copies; the region is
// last-value-wins and callers serialize writers above this layer.
unsafe impl Sync for SharedMemorySegment {}

impl SharedMemorySegment {
    /// Create a new zero-initialised region using the detected backend.
    ///
    /// # Errors
    /// Returns [`SegmentError::Allocation`] if the OS cannot provide it.
    pub fn create(name: &str, capacity: usize) -> Result<Self, SegmentError> {
        Self::create_with_backend(name, capacity, SegmentBackend::detect())
    }

    /// Create a new region with an explicit backend.
    pub fn create_with_backend(
        name: &str,
        capacity: usize,
        backend: SegmentBackend,
    ) -> Result<Self, SegmentError> {
        let alloc_err = |reason: String| SegmentError::Allocation {
            name: name.to_string(),
            reason,
        };

        if capacity == 0 {
            return Err(alloc_err("Capacity must be non-zero".to_string()));
        }

        let fd = backend.allocate(name).map_err(alloc_err)?;

        // SAFETY: fd is a valid file descriptor
        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), capacity as libc::off_t) };
        if result < 0 {
            return Err(alloc_err(format!(
                "ftruncate failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if backend == SegmentBackend::Modern {
            seal_size(&fd, name);
        }

        let ptr = map_shared(fd.as_raw_fd(), capacity)
            .map_err(|e| alloc_err(format!("mmap failed: {}", e)))?;

        // Zero-initialize the memory
        // SAFETY: ptr is valid for capacity bytes
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, capacity);
        }

        tracing::debug!(
            name = %name,
            capacity = capacity,
            backend = backend.name(),
            "Created shared memory segment"
        );

        Ok(Self {
            name: name.to_string(),
            ptr,
            capacity,
            fd: Some(fd),
            backend: Some(backend),
            origin: SegmentOrigin::Created,
        })
    }

    /// Map a region received from another process.
    ///
    /// # Errors
    /// Returns [`SegmentError::InvalidHandle`] if the handle references fewer
    /// than `capacity` bytes or cannot be mapped.
    pub fn open(handle: SegmentHandle, capacity: usize) -> Result<Self, SegmentError> {
        if capacity == 0 {
            return Err(SegmentError::InvalidHandle {
                reason: "Capacity must be non-zero".to_string(),
            });
        }

        let size = handle.size()?;
        if size < capacity {
            return Err(SegmentError::InvalidHandle {
                reason: format!("Region holds {} bytes, {} required", size, capacity),
            });
        }

        let name = handle.name().to_string();
        let fd = handle.into_fd();
        let ptr = map_shared(fd.as_raw_fd(), capacity).map_err(|e| {
            SegmentError::InvalidHandle {
                reason: format!("mmap failed: {}", e),
            }
        })?;

        tracing::debug!(name = %name, capacity = capacity, "Opened shared memory segment");

        Ok(Self {
            name,
            ptr,
            capacity,
            fd: Some(fd),
            backend: None,
            origin: SegmentOrigin::Opened,
        })
    }

    /// Get the name of this segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the capacity of this segment in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocation backend, `None` for a region opened from a handle.
    pub fn backend(&self) -> Option<SegmentBackend> {
        self.backend
    }

    pub fn origin(&self) -> SegmentOrigin {
        self.origin
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Duplicate the segment's descriptor for transfer to another process.
    ///
    /// The local mapping stays valid.
    pub fn export_handle(&self) -> Result<SegmentHandle, SegmentError> {
        let fd = self.fd.as_ref().ok_or_else(|| self.closed())?;
        let dup = fd.try_clone().map_err(|e| SegmentError::HandleExport {
            name: self.name.clone(),
            reason: format!("dup failed: {}", e),
        })?;
        Ok(SegmentHandle::new(dup, self.name.clone()))
    }

    /// Copy the whole region out.
    pub fn read_all(&self) -> Result<Vec<u8>, SegmentError> {
        self.read_range(0, self.capacity)
    }

    /// Copy `len` bytes starting at `offset` out of the region.
    pub fn read_range(&self, offset: usize, len: usize) -> Result<Vec<u8>, SegmentError> {
        self.ensure_open()?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.capacity)
            .ok_or(SegmentError::OutOfBounds {
                len: offset.saturating_add(len),
                capacity: self.capacity,
            })?;

        let mut buf = vec![0u8; end - offset];
        // SAFETY: [offset, end) lies within the mapping, buf has the same length
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), len);
        }
        Ok(buf)
    }

    /// Copy `bytes` into the region starting at offset 0.
    ///
    /// Bytes past `bytes.len()` are left untouched.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), SegmentError> {
        self.ensure_open()?;
        if bytes.len() > self.capacity {
            return Err(SegmentError::OutOfBounds {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }

        // SAFETY: bytes.len() <= capacity, the mapping is live
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), bytes.len());
        }
        Ok(())
    }

    /// Unmap the region and release the local descriptor. Idempotent.
    pub fn close(&mut self) {
        let Some(fd) = self.fd.take() else {
            return;
        };

        // SAFETY: ptr and capacity were set when the mapping was created
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.capacity) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %std::io::Error::last_os_error(),
                "Failed to unmap shared memory"
            );
        }

        drop(fd);
        tracing::debug!(name = %self.name, "Closed shared memory segment");
    }

    fn ensure_open(&self) -> Result<(), SegmentError> {
        if self.fd.is_none() {
            return Err(self.closed());
        }
        Ok(())
    }

    fn closed(&self) -> SegmentError {
        SegmentError::Closed {
            name: self.name.clone(),
        }
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("backend", &self.backend)
            .field("origin", &self.origin)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forbid resizing so a peer's mapping can never be truncated under it.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn seal_size(fd: &OwnedFd, name: &str) {
    // SAFETY: fd is a valid memfd created with MFD_ALLOW_SEALING
    let rc = unsafe {
        libc::fcntl(
            fd.as_raw_fd(),
            libc::F_ADD_SEALS,
            libc::F_SEAL_SHRINK | libc::F_SEAL_GROW,
        )
    };
    if rc < 0 {
        tracing::warn!(
            name = %name,
            error = %std::io::Error::last_os_error(),
            "Failed to seal segment size"
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn seal_size(_fd: &OwnedFd, _name: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_zeroed() {
        let segment = SharedMemorySegment::create("test-zeroed", 4096).unwrap();
        assert_eq!(segment.capacity(), 4096);
        assert_eq!(segment.origin(), SegmentOrigin::Created);
        assert!(segment.read_all().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            SharedMemorySegment::create("test-empty", 0),
            Err(SegmentError::Allocation { .. })
        ));
    }

    #[test]
    fn test_legacy_backend() {
        let segment =
            SharedMemorySegment::create_with_backend("test-legacy", 4096, SegmentBackend::Legacy)
                .unwrap();
        segment.write_all(b"legacy").unwrap();
        assert_eq!(segment.read_range(0, 6).unwrap(), b"legacy");
        assert_eq!(segment.backend(), Some(SegmentBackend::Legacy));
    }

    #[test]
    fn test_detect_is_cached() {
        assert_eq!(SegmentBackend::detect(), SegmentBackend::detect());
    }

    #[test]
    fn test_exported_handle_shares_memory() {
        let owner = SharedMemorySegment::create("test-share", 4096).unwrap();
        let handle = owner.export_handle().unwrap();
        assert_eq!(handle.name(), "test-share");

        let peer = SharedMemorySegment::open(handle, 4096).unwrap();
        assert_eq!(peer.origin(), SegmentOrigin::Opened);
        assert_eq!(peer.backend(), None);
        assert!(owner.backend().is_some());

        owner.write_all(b"from owner").unwrap();
        assert_eq!(peer.read_range(0, 10).unwrap(), b"from owner");

        peer.write_all(b"from peer!").unwrap();
        assert_eq!(owner.read_range(0, 10).unwrap(), b"from peer!");
    }

    #[test]
    fn test_open_rejects_short_region() {
        let owner = SharedMemorySegment::create("test-short", 4096).unwrap();
        let handle = owner.export_handle().unwrap();
        assert!(matches!(
            SharedMemorySegment::open(handle, 8192),
            Err(SegmentError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn test_write_out_of_bounds() {
        let segment = SharedMemorySegment::create("test-oob", 16).unwrap();
        assert!(segment.write_all(&[1u8; 17]).is_err());
        assert!(segment.read_range(10, 7).is_err());
        assert!(segment.read_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_local() {
        let mut owner = SharedMemorySegment::create("test-close", 4096).unwrap();
        let mut peer = SharedMemorySegment::open(owner.export_handle().unwrap(), 4096).unwrap();

        owner.write_all(b"kept").unwrap();
        peer.close();
        peer.close();
        assert!(peer.is_closed());
        assert!(matches!(peer.read_all(), Err(SegmentError::Closed { .. })));

        assert_eq!(owner.read_range(0, 4).unwrap(), b"kept");
        owner.close();
        assert!(owner.export_handle().is_err());
    }

    #[test]
    fn test_region_outlives_creator_mapping() {
        let mut owner = SharedMemorySegment::create("test-outlive", 4096).unwrap();
        owner.write_all(b"still here").unwrap();
        let peer = SharedMemorySegment::open(owner.export_handle().unwrap(), 4096).unwrap();
        owner.close();
        assert_eq!(peer.read_range(0, 10).unwrap(), b"still here");
    }
}
