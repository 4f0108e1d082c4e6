// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Byte pumps between a connected stream and the message queue.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::message::{self, FRAME_DELIMITER, MAX_FRAME_BYTES, Message};
use crate::reactor::{AsPollHandle, RawSocket};

const READ_CHUNK_BYTES: usize = 4096;

/// Early handler: sees each parsed message before it is queued.
/// Returning `true` consumes the message.
///
/// May run on the reactor's read thread, so it must not touch host state.
pub type EarlyHandler = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// FIFO of parsed messages shared between the reader and the host.
///
/// The lock is held only for a push or a pop.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.inner.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Outcome of one [`InboundPipe::pump_input`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStatus {
    pub bytes_read: usize,
    pub frames: usize,
    pub closed: bool,
}

#[derive(Default)]
struct ReaderState {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no delimiter.
    scanned: usize,
}

/// Read side of a channel.
///
/// Shared (through an `Arc`) by the owning host and the reactor, either of
/// which may pump it. Pumps are serialized so frames keep their order.
pub struct InboundPipe {
    stream: TcpStream,
    raw: RawSocket,
    label: String,
    reader: Mutex<ReaderState>,
    queue: Arc<MessageQueue>,
    early: RwLock<Option<EarlyHandler>>,
    closed: AtomicBool,
    malformed: Mutex<Option<String>>,
    total_bytes: AtomicU64,
}

impl std::fmt::Debug for InboundPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundPipe")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl InboundPipe {
    pub fn new(stream: TcpStream, queue: Arc<MessageQueue>, label: impl Into<String>) -> Self {
        let raw = stream.poll_handle();
        Self {
            stream,
            raw,
            label: label.into(),
            reader: Mutex::new(ReaderState::default()),
            queue,
            early: RwLock::new(None),
            closed: AtomicBool::new(false),
            malformed: Mutex::new(None),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn raw(&self) -> RawSocket {
        self.raw
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn set_early_handler(&self, handler: Option<EarlyHandler>) {
        *self.early.write() = handler;
    }

    /// Peer closed the stream or the stream failed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// First framing error seen on this pipe, if any.
    pub fn malformed(&self) -> Option<String> {
        self.malformed.lock().clone()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Drain everything currently readable, then parse and queue every
    /// complete frame. Never blocks.
    pub fn pump_input(&self) -> PumpStatus {
        let mut status = PumpStatus::default();
        if self.is_closed() {
            status.closed = true;
            return status;
        }

        let mut reader = self.reader.lock();
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!("[{}] Peer closed the connection", self.label);
                    self.closed.store(true, Ordering::Release);
                    break;
                }
                Ok(n) => {
                    reader.buffer.extend_from_slice(&chunk[..n]);
                    status.bytes_read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("[{}] Read failed: {}", self.label, e);
                    self.closed.store(true, Ordering::Release);
                    break;
                }
            }
        }
        self.total_bytes
            .fetch_add(status.bytes_read as u64, Ordering::Relaxed);

        let reader = &mut *reader;
        let mut start = 0;
        let mut cursor = reader.scanned;
        while let Some(offset) = reader.buffer[cursor..]
            .iter()
            .position(|b| *b == FRAME_DELIMITER)
        {
            let end = cursor + offset + 1;
            if self.accept_frame(&reader.buffer[start..end]) {
                status.frames += 1;
            }
            start = end;
            cursor = end;
        }
        reader.buffer.drain(..start);
        reader.scanned = reader.buffer.len();

        if reader.buffer.len() > MAX_FRAME_BYTES {
            self.mark_malformed(format!(
                "frame exceeds {} bytes without a terminator",
                MAX_FRAME_BYTES
            ));
            reader.buffer.clear();
            reader.scanned = 0;
            self.closed.store(true, Ordering::Release);
        }

        status.closed = self.is_closed();
        status
    }

    fn accept_frame(&self, frame: &[u8]) -> bool {
        let text = match std::str::from_utf8(frame) {
            Ok(text) => text,
            Err(e) => {
                self.mark_malformed(format!("frame is not UTF-8: {}", e));
                return false;
            }
        };
        if text.trim().is_empty() {
            return false;
        }

        let message = match message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                self.mark_malformed(e.to_string());
                return false;
            }
        };

        let handler = self.early.read().clone();
        if handler.is_some_and(|handler| handler(&message)) {
            return true;
        }

        self.queue.push(message);
        true
    }

    fn mark_malformed(&self, reason: String) {
        tracing::warn!("[{}] Malformed frame: {}", self.label, reason);
        let mut malformed = self.malformed.lock();
        if malformed.is_none() {
            *malformed = Some(reason);
        }
    }
}

/// Write side of a channel: frames wait here until the socket takes them.
#[derive(Debug)]
pub struct OutboundPump {
    stream: TcpStream,
    pending: Vec<u8>,
    cursor: usize,
    dead: bool,
}

impl OutboundPump {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            cursor: 0,
            dead: false,
        }
    }

    pub fn enqueue(&mut self, frame: &str) {
        self.pending.extend_from_slice(frame.as_bytes());
    }

    pub fn has_pending(&self) -> bool {
        self.cursor < self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len() - self.cursor
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Write as much as the socket accepts. Short writes advance the cursor;
    /// the rest goes out on a later call.
    pub fn pump_output(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while self.has_pending() && !self.dead {
            match (&self.stream).write(&self.pending[self.cursor..]) {
                Ok(0) => {
                    self.dead = true;
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(n) => {
                    self.cursor += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.dead = true;
                    return Err(e);
                }
            }
        }

        if !self.has_pending() {
            self.pending.clear();
            self.cursor = 0;
        } else if self.cursor > self.pending.len() / 2 {
            self.pending.drain(..self.cursor);
            self.cursor = 0;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn pump_until(pipe: &InboundPipe, frames: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipe.queue().len() < frames && Instant::now() < deadline {
            pipe.pump_input();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_frames_split_across_writes() {
        let (server, mut client) = pair();
        let queue = Arc::new(MessageQueue::new());
        let pipe = InboundPipe::new(server, queue.clone(), "test");

        let frame = message::generate(&Message::new("base", "one").with("k", "a\nb")).unwrap();
        let (head, tail) = frame.as_bytes().split_at(7);
        client.write_all(head).unwrap();
        pipe.pump_input();
        assert!(queue.is_empty());

        client.write_all(tail).unwrap();
        client
            .write_all(message::generate(&Message::new("base", "two")).unwrap().as_bytes())
            .unwrap();
        pump_until(&pipe, 2);

        assert_eq!(queue.pop().unwrap().get_str("k"), Some("a\nb"));
        assert!(queue.pop().unwrap().is("base", "two"));
    }

    #[test]
    fn test_burst_of_small_frames_keeps_order() {
        let (server, mut client) = pair();
        let queue = Arc::new(MessageQueue::new());
        let pipe = InboundPipe::new(server, queue.clone(), "test");

        let mut burst = String::new();
        for n in 0..2000i64 {
            burst.push_str(&message::generate(&Message::new("base", "tick").with("n", n)).unwrap());
        }
        // Leave the last frame open so it spans two pumps.
        let last = message::generate(&Message::new("base", "last")).unwrap();
        let (head, tail) = last.split_at(10);
        burst.push_str(head);
        client.write_all(burst.as_bytes()).unwrap();
        pump_until(&pipe, 2000);

        assert_eq!(queue.len(), 2000);
        for n in 0..2000i64 {
            assert_eq!(queue.pop().unwrap().get_int("n"), Some(n));
        }

        client.write_all(tail.as_bytes()).unwrap();
        pump_until(&pipe, 1);
        assert!(queue.pop().unwrap().is("base", "last"));
        assert!(pipe.malformed().is_none());
    }

    #[test]
    fn test_early_handler_consumes() {
        let (server, mut client) = pair();
        let queue = Arc::new(MessageQueue::new());
        let pipe = InboundPipe::new(server, queue.clone(), "test");
        pipe.set_early_handler(Some(Arc::new(|m: &Message| m.name() == "skip")));

        client
            .write_all(message::generate(&Message::new("base", "skip")).unwrap().as_bytes())
            .unwrap();
        client
            .write_all(message::generate(&Message::new("base", "keep")).unwrap().as_bytes())
            .unwrap();
        pump_until(&pipe, 1);

        assert_eq!(queue.len(), 1);
        assert!(queue.pop().unwrap().is("base", "keep"));
    }

    #[test]
    fn test_garbage_marks_malformed() {
        let (server, mut client) = pair();
        let pipe = InboundPipe::new(server, Arc::new(MessageQueue::new()), "test");
        client.write_all(b"not json at all\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while pipe.malformed().is_none() && Instant::now() < deadline {
            pipe.pump_input();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(pipe.malformed().is_some());
    }

    #[test]
    fn test_close_is_detected() {
        let (server, client) = pair();
        let pipe = InboundPipe::new(server, Arc::new(MessageQueue::new()), "test");
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !pipe.pump_input().closed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(pipe.is_closed());
    }

    #[test]
    fn test_outbound_delivers_everything() {
        let (server, mut client) = pair();
        let mut pump = OutboundPump::new(server);
        let frame = message::generate(&Message::new("base", "hi")).unwrap();
        pump.enqueue(&frame);
        pump.enqueue(&frame);
        assert_eq!(pump.pending_bytes(), frame.len() * 2);

        while pump.has_pending() {
            pump.pump_output().unwrap();
        }

        let mut received = vec![0u8; frame.len() * 2];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, [frame.as_bytes(), frame.as_bytes()].concat());
    }
}
