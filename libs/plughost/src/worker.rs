// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The worker's end of the host protocol.
//!
//! A worker receives the host's port as its first argument, connects, and
//! announces its message classes. [`WorkerConnection`] handles the
//! `internal` bookkeeping (hello, shared-memory add/remove, sleep time) and
//! leaves plugin loading and payload messages to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelSocket, MessageQueue};
use crate::config::deadline_after;
use crate::error::{HostError, Result};
use crate::host::protocol::{self, INTERNAL_CLASS, INTERNAL_VERSION};
use crate::message::{ClassVersion, Message, MessageClassVersions};
use crate::reactor::PollSet;
use crate::shm::{self, SharedMemoryRegion, ShmBackend};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_SLICE: Duration = Duration::from_millis(10);

pub struct WorkerConnection {
    channel: Channel,
    queue: Arc<MessageQueue>,
    backend: Arc<dyn ShmBackend>,
    negotiated: Option<MessageClassVersions>,
    sleep_time: Option<f64>,
    regions: BTreeMap<String, SharedMemoryRegion>,
}

impl WorkerConnection {
    /// Connect to the host on `127.0.0.1:port` and send `hello`.
    ///
    /// `internal` is announced automatically when missing from `versions`.
    pub fn connect(port: u16, versions: MessageClassVersions) -> Result<Self> {
        Self::connect_with_backend(port, versions, shm::default_backend())
    }

    pub fn connect_with_backend(
        port: u16,
        mut versions: MessageClassVersions,
        backend: Arc<dyn ShmBackend>,
    ) -> Result<Self> {
        let socket = ChannelSocket::connect_blocking("127.0.0.1", port, CONNECT_TIMEOUT)?;
        let queue = Arc::new(MessageQueue::new());
        let channel = Channel::new(socket, queue.clone(), "worker")?;

        if !versions.contains(INTERNAL_CLASS) {
            versions.insert(INTERNAL_CLASS, INTERNAL_VERSION);
        }

        let mut connection = Self {
            channel,
            queue,
            backend,
            negotiated: None,
            sleep_time: None,
            regions: BTreeMap::new(),
        };
        connection.send(&protocol::hello(&versions))?;
        Ok(connection)
    }

    /// Send a message. Anything the socket does not take now waits for
    /// [`flush`](Self::flush) or the next `recv`.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.channel.send(message)
    }

    #[cfg(test)]
    pub(crate) fn send_verbatim(&mut self, text: &str) -> Result<()> {
        self.channel.send_verbatim(text)
    }

    /// Wait up to `timeout` for the next message. `Ok(None)` on timeout or
    /// once the host has gone away with nothing left queued.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut poll = PollSet::new(&[self.channel.inbound().raw()]);
        loop {
            self.channel.pump_output()?;
            self.channel.pump_input();
            if let Some(message) = self.queue.pop() {
                return Ok(Some(message));
            }
            if self.channel.is_closed() {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            poll.wait((deadline - now).min(WAIT_SLICE))
                .map_err(|e| HostError::Socket(format!("poll failed: {}", e)))?;
        }
    }

    /// Push out pending output, giving up after `timeout`.
    pub fn flush(&mut self, timeout: Duration) -> Result<()> {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            self.channel.pump_output()?;
            if !self.channel.has_pending_output() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HostError::Socket(
                    "timed out flushing output to the host".to_string(),
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// The versions the host settled on, once its `hello` has arrived.
    pub fn negotiated(&self) -> Option<&MessageClassVersions> {
        self.negotiated.as_ref()
    }

    pub fn message_class_version(&self, class: &str) -> Option<ClassVersion> {
        self.negotiated.as_ref().and_then(|n| n.get(class))
    }

    /// Last poll interval the host asked for, in seconds.
    pub fn sleep_time(&self) -> Option<f64> {
        self.sleep_time
    }

    pub fn attach_shared_memory(&mut self, name: &str, size: usize) -> Result<&mut SharedMemoryRegion> {
        if self.regions.contains_key(name) {
            return Err(HostError::InvalidState(format!(
                "shared memory '{}' is already attached",
                name
            )));
        }
        let region = SharedMemoryRegion::attach(self.backend.as_ref(), name, size)?;
        Ok(self.regions.entry(name.to_string()).or_insert(region))
    }

    pub fn shared_memory(&mut self, name: &str) -> Option<&mut SharedMemoryRegion> {
        self.regions.get_mut(name)
    }

    pub fn shared_memory_names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    /// Handle the host's bookkeeping messages.
    ///
    /// Returns `Ok(true)` when `message` was one of `hello`, `sleep_time`,
    /// `shm_add` or `shm_remove` and has been answered; `load_plugin`,
    /// `shutdown_plugin` and payload messages return `Ok(false)`.
    pub fn serve_internal(&mut self, message: &Message) -> Result<bool> {
        if message.class() != INTERNAL_CLASS {
            return Ok(false);
        }

        match message.name() {
            protocol::HELLO => {
                let versions = message.value("versions").ok_or_else(|| {
                    HostError::Protocol("hello without 'versions'".to_string())
                })?;
                self.negotiated = Some(MessageClassVersions::from_value(versions)?);
                Ok(true)
            }
            protocol::SLEEP_TIME => {
                self.sleep_time = message.get_real("time");
                Ok(true)
            }
            protocol::SHM_ADD => {
                let name = message.get_str("name").unwrap_or_default().to_string();
                let size = message.get_int("size").unwrap_or(0).max(0) as usize;
                let error = self.attach_shared_memory(&name, size).err().map(|e| e.to_string());
                self.send(&protocol::shm_add_response(&name, error.as_deref()))?;
                Ok(true)
            }
            protocol::SHM_REMOVE => {
                let name = message.get_str("name").unwrap_or_default().to_string();
                if let Some(region) = self.regions.remove(&name) {
                    region.destroy()?;
                }
                self.send(&protocol::shm_remove_response(&name))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DEFAULT_SOCKET_BUFFER_BYTES, SocketKind};

    #[test]
    fn test_connect_sends_hello_with_internal() {
        let listener = ChannelSocket::open(SocketKind::Tcp, 0, DEFAULT_SOCKET_BUFFER_BYTES).unwrap();
        let versions = MessageClassVersions::new().with("media", ClassVersion::new(2, 1));
        let mut worker = WorkerConnection::connect(listener.local_port(), versions).unwrap();
        worker.flush(Duration::from_secs(1)).unwrap();

        let mut accepted = None;
        for _ in 0..200 {
            accepted = listener.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let queue = Arc::new(MessageQueue::new());
        let host = Channel::new(accepted.unwrap(), queue.clone(), "host").unwrap();

        for _ in 0..200 {
            host.pump_input();
            if !queue.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let hello = queue.pop().unwrap();
        assert!(hello.is(INTERNAL_CLASS, protocol::HELLO));
        let announced = MessageClassVersions::from_value(hello.value("versions").unwrap()).unwrap();
        assert_eq!(announced.get("media"), Some(ClassVersion::new(2, 1)));
        assert_eq!(announced.get(INTERNAL_CLASS), Some(INTERNAL_VERSION));
    }

    #[test]
    fn test_recv_times_out_quietly() {
        let listener = ChannelSocket::open(SocketKind::Tcp, 0, DEFAULT_SOCKET_BUFFER_BYTES).unwrap();
        let mut worker =
            WorkerConnection::connect(listener.local_port(), MessageClassVersions::new()).unwrap();
        let start = Instant::now();
        assert!(worker.recv(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
