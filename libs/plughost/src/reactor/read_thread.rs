// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::ReactorHandle;
use crate::error::{HostError, Result};

/// Upper bound on one wait, so a stop request is noticed promptly.
const READ_THREAD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Background thread that keeps polling the reactor until dropped.
pub(super) struct ReadThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReadThread {
    pub(super) fn spawn(reactor: ReactorHandle) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("plughost-read".to_string())
            .spawn(move || {
                tracing::debug!("Read thread started");
                while !stop_flag.load(Ordering::Acquire) {
                    if let Err(e) = reactor.poll(READ_THREAD_POLL_INTERVAL) {
                        tracing::warn!("Read thread poll failed: {}", e);
                        std::thread::sleep(READ_THREAD_POLL_INTERVAL);
                    }
                }
                tracing::debug!("Read thread stopped");
            })
            .map_err(|e| HostError::Other(anyhow::anyhow!("Failed to spawn read thread: {}", e)))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for ReadThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Read thread panicked");
            }
        }
    }
}
