// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host↔worker message channel over a loopback TCP stream.

mod pump;
mod socket;

use std::net::Shutdown;
use std::sync::Arc;

use crate::error::{HostError, Result};
use crate::message::{self, Message};

pub use pump::{EarlyHandler, InboundPipe, MessageQueue, OutboundPump, PumpStatus};
pub use socket::{ChannelSocket, DEFAULT_SOCKET_BUFFER_BYTES, SocketKind};

/// A connected, framed, non-blocking message channel.
///
/// Outgoing frames are buffered in an [`OutboundPump`]; incoming bytes land in
/// an [`InboundPipe`] that may also be pumped by a reactor.
#[derive(Debug)]
pub struct Channel {
    outbound: OutboundPump,
    inbound: Arc<InboundPipe>,
    shutdown_stream: std::net::TcpStream,
}

impl Channel {
    /// Wrap a connected socket. Parsed messages go to `queue`.
    pub fn new(socket: ChannelSocket, queue: Arc<MessageQueue>, label: &str) -> Result<Self> {
        let stream = socket.into_stream()?;
        let read_half = stream.try_clone()?;
        let shutdown_stream = stream.try_clone()?;
        Ok(Self {
            outbound: OutboundPump::new(stream),
            inbound: Arc::new(InboundPipe::new(read_half, queue, label)),
            shutdown_stream,
        })
    }

    /// Frame and enqueue a message, then write whatever the socket accepts now.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(HostError::Socket(format!(
                "cannot send {}:{} on a closed channel",
                message.class(),
                message.name()
            )));
        }
        let frame = message::generate(message)?;
        self.outbound.enqueue(&frame);
        self.pump_output()
    }

    /// Enqueue text as-is, with no framing or validation.
    #[cfg(test)]
    pub(crate) fn send_verbatim(&mut self, text: &str) -> Result<()> {
        self.outbound.enqueue(text);
        self.pump_output()
    }

    pub fn pump_output(&mut self) -> Result<()> {
        self.outbound
            .pump_output()
            .map(|_| ())
            .map_err(|e| HostError::Socket(format!("write failed: {}", e)))
    }

    pub fn pump_input(&self) -> PumpStatus {
        self.inbound.pump_input()
    }

    pub fn inbound(&self) -> &Arc<InboundPipe> {
        &self.inbound
    }

    pub fn has_pending_output(&self) -> bool {
        self.outbound.has_pending()
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed() || self.outbound.is_dead()
    }

    pub fn malformed(&self) -> Option<String> {
        self.inbound.malformed()
    }

    /// Shut the stream down in both directions. Idempotent.
    pub fn shutdown(&self) {
        if let Err(e) = self.shutdown_stream.shutdown(Shutdown::Both) {
            tracing::trace!("[{}] shutdown: {}", self.inbound.label(), e);
        }
    }
}
