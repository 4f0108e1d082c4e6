// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! POSIX `shm_open` regions.

use std::ffi::CString;
use std::io;

use super::{ShmBackend, ShmMapping};
use crate::config::ShmBackendKind;
use crate::error::{HostError, Result};

const NAME_PREFIX: &str = "/PH";

#[derive(Debug, Clone, Copy, Default)]
pub struct PosixShmBackend;

impl PosixShmBackend {
    fn c_name(&self, name: &str) -> Result<CString> {
        CString::new(self.os_name(name)).map_err(|_| {
            HostError::SharedMemory(format!("region name '{}' contains a NUL byte", name))
        })
    }
}

fn shm_error(step: &str, name: &str) -> HostError {
    HostError::SharedMemory(format!(
        "{} failed for '{}': {}",
        step,
        name,
        io::Error::last_os_error()
    ))
}

#[cfg(target_vendor = "apple")]
unsafe fn shm_open(name: &CString, flags: libc::c_int) -> libc::c_int {
    // Variadic on Apple platforms; the mode must be promoted to c_uint.
    unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::c_uint) }
}

#[cfg(not(target_vendor = "apple"))]
unsafe fn shm_open(name: &CString, flags: libc::c_int) -> libc::c_int {
    unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) }
}

/// Map `size` bytes of `fd` read/write and shared.
fn map_shared(fd: libc::c_int, size: usize) -> Option<*mut u8> {
    // SAFETY: fd is an open shm descriptor at least `size` bytes long.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    (ptr != libc::MAP_FAILED).then_some(ptr as *mut u8)
}

/// Current size of the object behind `fd`.
fn object_size(fd: libc::c_int) -> io::Result<u64> {
    // SAFETY: an all-zero `stat` is a valid out-parameter.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is open and `stat` outlives the call.
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size.max(0) as u64)
}

/// Unlink, treating an already-removed name as success.
fn unlink(c_name: &CString) -> io::Result<()> {
    // SAFETY: c_name is a valid NUL-terminated string.
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        Ok(())
    } else {
        Err(err)
    }
}

impl ShmBackend for PosixShmBackend {
    fn kind(&self) -> ShmBackendKind {
        ShmBackendKind::Posix
    }

    fn os_name(&self, name: &str) -> String {
        format!("{}{}", NAME_PREFIX, name)
    }

    fn create(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>> {
        let c_name = self.c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { shm_open(&c_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) };
        if fd < 0 {
            return Err(shm_error("shm_open", name));
        }

        // SAFETY: fd is the descriptor we just opened.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = shm_error("ftruncate", name);
            unsafe { libc::close(fd) };
            let _ = unlink(&c_name);
            return Err(err);
        }

        let Some(ptr) = map_shared(fd, size) else {
            let err = shm_error("mmap", name);
            unsafe { libc::close(fd) };
            let _ = unlink(&c_name);
            return Err(err);
        };

        Ok(Box::new(PosixMapping {
            ptr,
            len: size,
            fd,
            c_name,
            unlink_on_release: true,
        }))
    }

    fn attach(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>> {
        let c_name = self.c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { shm_open(&c_name, libc::O_RDWR) };
        if fd < 0 {
            return Err(shm_error("shm_open", name));
        }

        // Mapping past the end of the object would fault on first touch.
        let actual = match object_size(fd) {
            Ok(actual) => actual,
            Err(e) => {
                // SAFETY: fd is the descriptor we just opened.
                unsafe { libc::close(fd) };
                return Err(HostError::SharedMemory(format!(
                    "fstat failed for '{}': {}",
                    name, e
                )));
            }
        };
        if actual < size as u64 {
            // SAFETY: fd is the descriptor we just opened.
            unsafe { libc::close(fd) };
            return Err(HostError::SharedMemory(format!(
                "region '{}' holds {} bytes, {} requested",
                name, actual, size
            )));
        }

        let Some(ptr) = map_shared(fd, size) else {
            let err = shm_error("mmap", name);
            unsafe { libc::close(fd) };
            return Err(err);
        };

        // Both sides now hold the mapping, so the name can go.
        if let Err(e) = unlink(&c_name) {
            tracing::debug!("shm_unlink after attach of '{}': {}", name, e);
        }

        Ok(Box::new(PosixMapping {
            ptr,
            len: size,
            fd,
            c_name,
            unlink_on_release: false,
        }))
    }
}

struct PosixMapping {
    ptr: *mut u8,
    len: usize,
    fd: libc::c_int,
    c_name: CString,
    unlink_on_release: bool,
}

// SAFETY: the mapping stays valid until release(); access is through raw
// pointers into process-shared memory.
unsafe impl Send for PosixMapping {}
unsafe impl Sync for PosixMapping {}

impl ShmMapping for PosixMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn release(&mut self) -> Result<()> {
        let mut first_error = None;

        // SAFETY: ptr/len describe the mapping created in create()/attach().
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } != 0 {
            first_error.get_or_insert(shm_error("munmap", &self.c_name.to_string_lossy()));
        }
        // SAFETY: fd is owned by this mapping and closed exactly once.
        if unsafe { libc::close(self.fd) } != 0 {
            first_error.get_or_insert(shm_error("close", &self.c_name.to_string_lossy()));
        }
        if self.unlink_on_release {
            if let Err(e) = unlink(&self.c_name) {
                first_error.get_or_insert(HostError::SharedMemory(format!(
                    "shm_unlink failed for '{}': {}",
                    self.c_name.to_string_lossy(),
                    e
                )));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
