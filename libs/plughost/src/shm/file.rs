// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! File-backed regions in the temp directory.
//!
//! Useful where `/dev/shm` is unavailable or too small. Only the creator
//! removes the backing file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use super::{ShmBackend, ShmMapping};
use crate::config::ShmBackendKind;
use crate::error::{HostError, Result};

const FILE_PREFIX: &str = "plughost_";

#[derive(Debug, Clone)]
pub struct FileShmBackend {
    dir: PathBuf,
}

impl Default for FileShmBackend {
    fn default() -> Self {
        Self::in_dir(std::env::temp_dir())
    }
}

impl FileShmBackend {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", FILE_PREFIX, name))
    }
}

fn file_error(step: &str, path: &std::path::Path, e: io::Error) -> HostError {
    HostError::SharedMemory(format!("{} failed for {}: {}", step, path.display(), e))
}

fn map_file(file: &File, size: usize) -> io::Result<*mut u8> {
    // SAFETY: the file is open read/write and at least `size` bytes long.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

impl ShmBackend for FileShmBackend {
    fn kind(&self) -> ShmBackendKind {
        ShmBackendKind::File
    }

    fn os_name(&self, name: &str) -> String {
        self.path(name).display().to_string()
    }

    fn create(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>> {
        let path = self.path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| file_error("create", &path, e))?;

        let prepared = file
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .and_then(|_| file.set_len(size as u64))
            .and_then(|_| map_file(&file, size));

        match prepared {
            Ok(ptr) => Ok(Box::new(FileMapping {
                ptr,
                len: size,
                file: Some(file),
                path,
                owns_file: true,
            })),
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(&path);
                Err(file_error("map", &path, e))
            }
        }
    }

    fn attach(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>> {
        let path = self.path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| file_error("open", &path, e))?;

        let actual = file
            .metadata()
            .map_err(|e| file_error("stat", &path, e))?
            .len();
        if actual < size as u64 {
            return Err(HostError::SharedMemory(format!(
                "{} holds {} bytes, {} requested",
                path.display(),
                actual,
                size
            )));
        }

        let ptr = map_file(&file, size).map_err(|e| file_error("mmap", &path, e))?;
        Ok(Box::new(FileMapping {
            ptr,
            len: size,
            file: Some(file),
            path,
            owns_file: false,
        }))
    }
}

struct FileMapping {
    ptr: *mut u8,
    len: usize,
    file: Option<File>,
    path: PathBuf,
    owns_file: bool,
}

// SAFETY: the mapping stays valid until release(); the memory is shared.
unsafe impl Send for FileMapping {}
unsafe impl Sync for FileMapping {}

impl ShmMapping for FileMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn release(&mut self) -> Result<()> {
        // SAFETY: ptr/len describe the live mapping.
        let unmapped = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } == 0;
        let unmap_error = (!unmapped).then(io::Error::last_os_error);

        self.file.take();

        if self.owns_file {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(file_error("remove", &self.path, e)),
            }
        }

        match unmap_error {
            Some(e) => Err(file_error("munmap", &self.path, e)),
            None => Ok(()),
        }
    }
}
