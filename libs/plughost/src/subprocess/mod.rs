// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker process launching.
//!
//! The host only needs to start a worker with a command line, watch whether
//! it is alive, and end it. [`ProcessLauncher`] is the seam tests use to swap
//! in their own workers.

mod launcher;
mod process_handle;

pub use launcher::{ExitInfo, ProcessLauncher, StdProcessLauncher, WorkerProcess};
pub use process_handle::ProcessHandle;
