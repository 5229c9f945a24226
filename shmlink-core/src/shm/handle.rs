// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transferable segment handle.
//!
//! A handle is an owned file descriptor referencing the segment's memory
//! object. Dropping it closes the descriptor; the kernel keeps the region
//! alive while any descriptor or mapping refers to it.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::error::SegmentError;

/// Owned, transferable reference to a shared memory region.
#[derive(Debug)]
pub struct SegmentHandle {
    fd: OwnedFd,
    name: String,
}

impl SegmentHandle {
    /// Wrap a descriptor received from another process.
    ///
    /// `name` is informational only; it is never used to look the region up.
    pub fn new(fd: OwnedFd, name: impl Into<String>) -> Self {
        Self {
            fd,
            name: name.into(),
        }
    }

    /// Diagnostic name of the region this handle references.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the referenced memory object in bytes.
    pub fn size(&self) -> Result<usize, SegmentError> {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is a valid open descriptor, stat points to writable storage
        let rc = unsafe { libc::fstat(self.fd.as_raw_fd(), stat.as_mut_ptr()) };
        if rc < 0 {
            return Err(SegmentError::InvalidHandle {
                reason: format!("fstat failed: {}", std::io::Error::last_os_error()),
            });
        }
        // SAFETY: fstat succeeded and initialised the struct
        let stat = unsafe { stat.assume_init() };
        if stat.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Err(SegmentError::InvalidHandle {
                reason: "descriptor does not reference a memory object".to_string(),
            });
        }
        Ok(stat.st_size as usize)
    }

    /// Duplicate the descriptor. The original stays valid.
    pub fn try_clone(&self) -> Result<Self, SegmentError> {
        let fd = self
            .fd
            .try_clone()
            .map_err(|e| SegmentError::HandleExport {
                name: self.name.clone(),
                reason: format!("dup failed: {}", e),
            })?;
        Ok(Self {
            fd,
            name: self.name.clone(),
        })
    }

    /// Consume the handle, returning the descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SegmentHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SegmentHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
