// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Shared readiness poller for every host's inbound pipe.
//!
//! Hosts register their pipe once connected. The poll set is rebuilt lazily:
//! registration only flags it dirty, and the next [`Reactor::poll`] rebuilds.
//! Polling can run on the caller's thread or on a dedicated read thread.

mod read_thread;
mod sys;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::InboundPipe;
use crate::config::ReactorConfig;
use crate::error::{HostError, Result};

use read_thread::ReadThread;
pub use sys::{AsPollHandle, PollSet, RawSocket};

/// Token returned by [`ReactorHandle::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

#[derive(Default)]
struct Registry {
    pipes: Vec<(RegistrationId, Arc<InboundPipe>)>,
    next_id: u64,
    dirty: bool,
}

struct PollCache {
    set: PollSet,
    pipes: Vec<Arc<InboundPipe>>,
}

struct ReactorInner {
    registry: Mutex<Registry>,
    cache: Mutex<PollCache>,
    rebuilds: AtomicU64,
    max_poll_timeout: Duration,
}

/// Cheap cloneable handle used by hosts to register their pipes.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Arc<ReactorInner>,
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("registered", &self.registered())
            .field("rebuilds", &self.rebuild_count())
            .finish()
    }
}

impl ReactorHandle {
    fn new(max_poll_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                registry: Mutex::new(Registry::default()),
                cache: Mutex::new(PollCache {
                    set: PollSet::new(&[]),
                    pipes: Vec::new(),
                }),
                rebuilds: AtomicU64::new(0),
                max_poll_timeout,
            }),
        }
    }

    /// Add a pipe. Takes effect on the next poll. Registering the same pipe
    /// twice returns the existing id.
    pub fn register(&self, pipe: Arc<InboundPipe>) -> RegistrationId {
        let mut registry = self.inner.registry.lock();
        if let Some((id, _)) = registry.pipes.iter().find(|(_, p)| Arc::ptr_eq(p, &pipe)) {
            return *id;
        }
        let id = RegistrationId(registry.next_id);
        registry.next_id += 1;
        tracing::debug!("Reactor: registering '{}' as {:?}", pipe.label(), id);
        registry.pipes.push((id, pipe));
        registry.dirty = true;
        id
    }

    /// Remove a pipe. Unknown ids are ignored.
    pub fn unregister(&self, id: RegistrationId) {
        let mut registry = self.inner.registry.lock();
        let before = registry.pipes.len();
        registry.pipes.retain(|(existing, _)| *existing != id);
        if registry.pipes.len() != before {
            tracing::debug!("Reactor: unregistered {:?}", id);
            registry.dirty = true;
        }
    }

    fn unregister_pipe(&self, pipe: &Arc<InboundPipe>) {
        let id = {
            let registry = self.inner.registry.lock();
            registry
                .pipes
                .iter()
                .find(|(_, p)| Arc::ptr_eq(p, pipe))
                .map(|(id, _)| *id)
        };
        if let Some(id) = id {
            self.unregister(id);
        }
    }

    pub fn registered(&self) -> usize {
        self.inner.registry.lock().pipes.len()
    }

    /// How many times the poll set has been rebuilt.
    pub fn rebuild_count(&self) -> u64 {
        self.inner.rebuilds.load(Ordering::Relaxed)
    }

    /// Wait up to `timeout` for input, then pump every ready pipe.
    /// Returns how many pipes were pumped.
    pub fn poll(&self, timeout: Duration) -> Result<usize> {
        let timeout = timeout.min(self.inner.max_poll_timeout);
        let mut cache = self.inner.cache.lock();

        {
            let mut registry = self.inner.registry.lock();
            if registry.dirty {
                let handles: Vec<RawSocket> =
                    registry.pipes.iter().map(|(_, p)| p.raw()).collect();
                cache.set = PollSet::new(&handles);
                cache.pipes = registry.pipes.iter().map(|(_, p)| p.clone()).collect();
                registry.dirty = false;
                let rebuilds = self.inner.rebuilds.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(
                    "Reactor: rebuilt poll set ({} pipes, rebuild #{})",
                    handles.len(),
                    rebuilds
                );
            }
        }

        let ready = cache
            .set
            .wait(timeout)
            .map_err(|e| HostError::Socket(format!("poll failed: {}", e)))?;

        let mut closed = Vec::new();
        for &index in &ready {
            let Some(pipe) = cache.pipes.get(index) else {
                continue;
            };
            if pipe.pump_input().closed {
                closed.push(pipe.clone());
            }
        }
        drop(cache);

        for pipe in &closed {
            self.unregister_pipe(pipe);
        }
        Ok(ready.len())
    }
}

/// Owns the registry and, optionally, the thread that polls it.
pub struct Reactor {
    handle: ReactorHandle,
    read_thread: Option<ReadThread>,
}

impl Reactor {
    pub fn new(config: &ReactorConfig) -> Result<Self> {
        let mut reactor = Self {
            handle: ReactorHandle::new(config.max_poll_timeout()),
            read_thread: None,
        };
        reactor.set_use_read_thread(config.use_read_thread)?;
        Ok(reactor)
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn uses_read_thread(&self) -> bool {
        self.read_thread.is_some()
    }

    /// Start or stop the dedicated read thread.
    pub fn set_use_read_thread(&mut self, enabled: bool) -> Result<()> {
        match (enabled, self.read_thread.is_some()) {
            (true, false) => {
                self.read_thread = Some(ReadThread::spawn(self.handle.clone())?);
            }
            (false, true) => {
                // Dropping joins the thread.
                self.read_thread = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Poll on the caller's thread. With a read thread running this only
    /// sleeps, since the thread does the pumping.
    pub fn poll(&self, timeout: Duration) -> Result<usize> {
        if self.read_thread.is_some() {
            std::thread::sleep(timeout.min(self.handle.inner.max_poll_timeout));
            return Ok(0);
        }
        self.handle.poll(timeout)
    }

    pub fn register(&self, pipe: Arc<InboundPipe>) -> RegistrationId {
        self.handle.register(pipe)
    }

    pub fn unregister(&self, id: RegistrationId) {
        self.handle.unregister(id);
    }

    pub fn registered(&self) -> usize {
        self.handle.registered()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.handle.rebuild_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageQueue;
    use crate::message::{self, Message};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn pipe(label: &str) -> (Arc<InboundPipe>, TcpStream, Arc<MessageQueue>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let queue = Arc::new(MessageQueue::new());
        (Arc::new(InboundPipe::new(server, queue.clone(), label)), client, queue)
    }

    fn config() -> ReactorConfig {
        ReactorConfig::default()
    }

    #[test]
    fn test_registration_rebuilds_lazily() {
        let reactor = Reactor::new(&config()).unwrap();
        let (a, _ca, _) = pipe("a");
        let (b, _cb, _) = pipe("b");

        let id_a = reactor.register(a.clone());
        reactor.register(b);
        assert_eq!(reactor.register(a), id_a);
        assert_eq!(reactor.registered(), 2);
        assert_eq!(reactor.rebuild_count(), 0);

        reactor.poll(Duration::from_millis(1)).unwrap();
        assert_eq!(reactor.rebuild_count(), 1);

        reactor.poll(Duration::from_millis(1)).unwrap();
        assert_eq!(reactor.rebuild_count(), 1);

        reactor.unregister(id_a);
        reactor.poll(Duration::from_millis(1)).unwrap();
        assert_eq!(reactor.rebuild_count(), 2);
        assert_eq!(reactor.registered(), 1);
    }

    #[test]
    fn test_poll_pumps_ready_pipe() {
        let reactor = Reactor::new(&config()).unwrap();
        let (a, mut client, queue) = pipe("a");
        reactor.register(a);

        client
            .write_all(message::generate(&Message::new("base", "ping")).unwrap().as_bytes())
            .unwrap();

        for _ in 0..100 {
            reactor.poll(Duration::from_millis(20)).unwrap();
            if !queue.is_empty() {
                break;
            }
        }
        assert!(queue.pop().unwrap().is("base", "ping"));
    }

    #[test]
    fn test_closed_pipe_is_dropped() {
        let reactor = Reactor::new(&config()).unwrap();
        let (a, client, _) = pipe("a");
        reactor.register(a);
        drop(client);

        for _ in 0..100 {
            reactor.poll(Duration::from_millis(20)).unwrap();
            if reactor.registered() == 0 {
                break;
            }
        }
        assert_eq!(reactor.registered(), 0);
    }

    #[test]
    fn test_read_thread_pumps_in_background() {
        let mut reactor = Reactor::new(&config()).unwrap();
        reactor.set_use_read_thread(true).unwrap();
        assert!(reactor.uses_read_thread());

        let (a, mut client, queue) = pipe("a");
        reactor.register(a);
        client
            .write_all(message::generate(&Message::new("base", "bg")).unwrap().as_bytes())
            .unwrap();

        for _ in 0..200 {
            if !queue.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(queue.pop().unwrap().is("base", "bg"));

        reactor.set_use_read_thread(false).unwrap();
        assert!(!reactor.uses_read_thread());
    }
}
