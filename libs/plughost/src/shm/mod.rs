// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Named shared-memory regions exchanged between host and worker.
//!
//! The host creates a region and tells the worker its name; the worker
//! attaches by name. Teardown always runs unmap, then close, then unlink
//! (creator only), whether through [`SharedMemoryRegion::destroy`] or `Drop`.

#[cfg(unix)]
mod file;
#[cfg(unix)]
mod posix;
#[cfg(windows)]
mod win32;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ShmBackendKind;
use crate::error::{HostError, Result};

#[cfg(unix)]
pub use file::FileShmBackend;
#[cfg(unix)]
pub use posix::PosixShmBackend;
#[cfg(windows)]
pub use win32::Win32ShmBackend;

static REGION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique region name: `"{pid}_{counter}"`. Backends add their own prefix.
pub fn generate_region_name() -> String {
    let counter = REGION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}", std::process::id(), counter)
}

/// Which side of the exchange a handle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmRole {
    Creator,
    Attacher,
}

/// A live mapping produced by a backend.
pub trait ShmMapping: Send + Sync {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    /// Unmap, close, and (for the creator) unlink. Called at most once.
    fn release(&mut self) -> Result<()>;
}

/// An OS shared-memory mechanism.
pub trait ShmBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> ShmBackendKind;

    /// OS-level identifier for a logical region name.
    fn os_name(&self, name: &str) -> String;

    fn create(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>>;

    fn attach(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>>;
}

/// Resolve a configured backend kind for this platform.
pub fn backend_for(kind: ShmBackendKind) -> Result<Arc<dyn ShmBackend>> {
    match kind {
        ShmBackendKind::Auto => Ok(default_backend()),
        #[cfg(unix)]
        ShmBackendKind::Posix => Ok(Arc::new(PosixShmBackend)),
        #[cfg(unix)]
        ShmBackendKind::File => Ok(Arc::new(FileShmBackend::default())),
        #[cfg(windows)]
        ShmBackendKind::Win32 => Ok(Arc::new(Win32ShmBackend)),
        #[allow(unreachable_patterns)]
        other => Err(HostError::NotSupported(format!(
            "shared memory backend {:?} is not available on this platform",
            other
        ))),
    }
}

#[cfg(unix)]
pub fn default_backend() -> Arc<dyn ShmBackend> {
    Arc::new(PosixShmBackend)
}

#[cfg(windows)]
pub fn default_backend() -> Arc<dyn ShmBackend> {
    Arc::new(Win32ShmBackend)
}

/// One mapped region plus the bookkeeping to tear it down.
pub struct SharedMemoryRegion {
    name: String,
    size: usize,
    role: ShmRole,
    mapping: Option<Box<dyn ShmMapping>>,
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("role", &self.role)
            .field("mapped", &self.mapping.is_some())
            .finish()
    }
}

impl SharedMemoryRegion {
    /// Create a region under a freshly generated name.
    pub fn create(backend: &dyn ShmBackend, size: usize) -> Result<Self> {
        Self::create_named(backend, &generate_region_name(), size)
    }

    pub fn create_named(backend: &dyn ShmBackend, name: &str, size: usize) -> Result<Self> {
        check_size(size)?;
        let mapping = backend.create(name, size)?;
        tracing::debug!(
            "Created shared memory '{}' ({} bytes) at {}",
            name,
            size,
            backend.os_name(name)
        );
        Ok(Self {
            name: name.to_string(),
            size,
            role: ShmRole::Creator,
            mapping: Some(mapping),
        })
    }

    /// Map a region another process created.
    pub fn attach(backend: &dyn ShmBackend, name: &str, size: usize) -> Result<Self> {
        check_size(size)?;
        let mapping = backend.attach(name, size)?;
        tracing::debug!("Attached shared memory '{}' ({} bytes)", name, size);
        Ok(Self {
            name: name.to_string(),
            size,
            role: ShmRole::Attacher,
            mapping: Some(mapping),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn role(&self) -> ShmRole {
        self.role
    }

    /// Base address, or null once destroyed.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping
            .as_ref()
            .map_or(std::ptr::null_mut(), |m| m.as_ptr())
    }

    fn checked_ptr(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let mapping = self.mapping.as_ref().ok_or_else(|| {
            HostError::SharedMemory(format!("region '{}' is not mapped", self.name))
        })?;
        let end = offset.checked_add(len).filter(|end| *end <= mapping.len());
        if end.is_none() {
            return Err(HostError::SharedMemory(format!(
                "range {}..{} is outside region '{}' of {} bytes",
                offset,
                offset.saturating_add(len),
                self.name,
                mapping.len()
            )));
        }
        // SAFETY: offset is within the mapping, checked above.
        Ok(unsafe { mapping.as_ptr().add(offset) })
    }

    /// Copy bytes out of the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let src = self.checked_ptr(offset, buf.len())?;
        // SAFETY: the source range is inside the live mapping and cannot
        // overlap a caller-owned buffer.
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read(offset, &mut byte)?;
        Ok(byte[0])
    }

    /// Copy bytes into the region.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let dst = self.checked_ptr(offset, data.len())?;
        // SAFETY: the destination range is inside the live mapping.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn fill(&mut self, byte: u8) -> Result<()> {
        let dst = self.checked_ptr(0, self.size)?;
        // SAFETY: the whole mapping is writable.
        unsafe { std::ptr::write_bytes(dst, byte, self.size) };
        Ok(())
    }

    /// Tear down now and report any failure. `Drop` does the same silently.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        match self.mapping.take() {
            Some(mut mapping) => {
                tracing::debug!("Releasing shared memory '{}' ({:?})", self.name, self.role);
                mapping.release()
            }
            None => Ok(()),
        }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release shared memory '{}': {}", self.name, e);
        }
    }
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(HostError::SharedMemory(
            "shared memory size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..64).map(|_| generate_region_name()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for name in handle.join().unwrap() {
                assert!(name.starts_with(&format!("{}_", std::process::id())));
                assert!(seen.insert(name));
            }
        }
        assert_eq!(seen.len(), 8 * 64);
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let backend = default_backend();
        assert!(SharedMemoryRegion::create(backend.as_ref(), 0).is_err());
        assert!(SharedMemoryRegion::attach(backend.as_ref(), "nope", 0).is_err());
    }

    #[test]
    fn test_writes_are_visible_through_attached_handle() {
        let backend = default_backend();
        let mut created = SharedMemoryRegion::create(backend.as_ref(), 0x10000).unwrap();
        let attached =
            SharedMemoryRegion::attach(backend.as_ref(), created.name(), created.size()).unwrap();
        assert_eq!(created.role(), ShmRole::Creator);
        assert_eq!(attached.role(), ShmRole::Attacher);

        created.fill(0xAB).unwrap();
        assert_eq!(attached.read_byte(0).unwrap(), 0xAB);
        assert_eq!(attached.read_byte(0xFFFF).unwrap(), 0xAB);

        created.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        attached.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        attached.destroy().unwrap();
        created.destroy().unwrap();
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let backend = default_backend();
        let mut region = SharedMemoryRegion::create(backend.as_ref(), 16).unwrap();
        assert!(region.read_byte(16).is_err());
        assert!(region.write(10, &[0u8; 7]).is_err());
        assert!(region.read(usize::MAX, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn test_attach_to_missing_region_fails() {
        let backend = default_backend();
        let name = generate_region_name();
        let err = SharedMemoryRegion::attach(backend.as_ref(), &name, 64).unwrap_err();
        assert!(matches!(err, HostError::SharedMemory(_)));
    }

    #[test]
    fn test_backend_for_platform() {
        assert!(backend_for(ShmBackendKind::Auto).is_ok());
        #[cfg(unix)]
        {
            assert_eq!(backend_for(ShmBackendKind::File).unwrap().kind(), ShmBackendKind::File);
            assert!(backend_for(ShmBackendKind::Win32).is_err());
        }
        #[cfg(windows)]
        assert!(backend_for(ShmBackendKind::Posix).is_err());
    }
}
