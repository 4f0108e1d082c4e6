// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Named mappings backed by the paging file.

use std::io;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE,
    UnmapViewOfFile, VirtualQuery,
};

use super::{ShmBackend, ShmMapping};
use crate::config::ShmBackendKind;
use crate::error::{HostError, Result};

const NAME_PREFIX: &str = "Local\\PH_";

#[derive(Debug, Clone, Copy, Default)]
pub struct Win32ShmBackend;

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn win_error(step: &str, name: &str) -> HostError {
    HostError::SharedMemory(format!(
        "{} failed for '{}': {}",
        step,
        name,
        io::Error::last_os_error()
    ))
}

fn map_view(handle: HANDLE, size: usize) -> Option<*mut u8> {
    // SAFETY: handle is a live file-mapping handle of at least `size` bytes.
    let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
    (!view.Value.is_null()).then_some(view.Value as *mut u8)
}

/// Bytes mapped at `ptr`, as reported by the memory manager.
fn view_size(ptr: *mut u8) -> usize {
    // SAFETY: an all-zero MEMORY_BASIC_INFORMATION is a valid out-parameter.
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    // SAFETY: ptr is the base of a live view and `info` outlives the call.
    let written = unsafe {
        VirtualQuery(
            ptr as *const _,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 { 0 } else { info.RegionSize }
}

impl ShmBackend for Win32ShmBackend {
    fn kind(&self) -> ShmBackendKind {
        ShmBackendKind::Win32
    }

    fn os_name(&self, name: &str) -> String {
        format!("{}{}", NAME_PREFIX, name)
    }

    fn create(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>> {
        let wide_name = wide(&self.os_name(name));
        let size64 = size as u64;

        // SAFETY: wide_name is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (size64 >> 32) as u32,
                (size64 & 0xFFFF_FFFF) as u32,
                wide_name.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(win_error("CreateFileMappingW", name));
        }

        let Some(ptr) = map_view(handle, size) else {
            let err = win_error("MapViewOfFile", name);
            unsafe { CloseHandle(handle) };
            return Err(err);
        };

        Ok(Box::new(Win32Mapping {
            ptr,
            len: size,
            handle,
        }))
    }

    fn attach(&self, name: &str, size: usize) -> Result<Box<dyn ShmMapping>> {
        let wide_name = wide(&self.os_name(name));

        // SAFETY: wide_name is NUL-terminated and outlives the call.
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide_name.as_ptr()) };
        if handle.is_null() {
            return Err(win_error("OpenFileMappingW", name));
        }

        // Map the whole object, then check it covers what was asked for.
        let Some(ptr) = map_view(handle, 0) else {
            let err = win_error("MapViewOfFile", name);
            // SAFETY: handle came from OpenFileMappingW above.
            unsafe { CloseHandle(handle) };
            return Err(err);
        };

        let actual = view_size(ptr);
        if actual < size {
            let view = MEMORY_MAPPED_VIEW_ADDRESS { Value: ptr as *mut _ };
            // SAFETY: view and handle were created above and are not shared yet.
            unsafe {
                UnmapViewOfFile(view);
                CloseHandle(handle);
            }
            return Err(HostError::SharedMemory(format!(
                "region '{}' holds {} bytes, {} requested",
                name, actual, size
            )));
        }

        Ok(Box::new(Win32Mapping {
            ptr,
            len: size,
            handle,
        }))
    }
}

/// The kernel object disappears with its last handle, so there is no unlink.
struct Win32Mapping {
    ptr: *mut u8,
    len: usize,
    handle: HANDLE,
}

// SAFETY: the view stays valid until release(); the memory is shared.
unsafe impl Send for Win32Mapping {}
unsafe impl Sync for Win32Mapping {}

impl ShmMapping for Win32Mapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn release(&mut self) -> Result<()> {
        let view = MEMORY_MAPPED_VIEW_ADDRESS {
            Value: self.ptr as *mut _,
        };
        // SAFETY: view and handle come from create()/attach() and are released once.
        let unmapped = unsafe { UnmapViewOfFile(view) } != 0;
        let unmap_error = (!unmapped).then(io::Error::last_os_error);
        let closed = unsafe { CloseHandle(self.handle) } != 0;

        match (unmap_error, closed) {
            (Some(e), _) => Err(HostError::SharedMemory(format!("UnmapViewOfFile failed: {}", e))),
            (None, false) => Err(HostError::SharedMemory(format!(
                "CloseHandle failed: {}",
                io::Error::last_os_error()
            ))),
            (None, true) => Ok(()),
        }
    }
}
