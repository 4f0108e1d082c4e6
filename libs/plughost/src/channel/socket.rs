// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Non-blocking TCP/UDP sockets on the loopback interface.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::{HostError, Result};
use crate::reactor::{AsPollHandle, RawSocket};

/// Default kernel send/receive buffer size applied at creation.
pub const DEFAULT_SOCKET_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

#[derive(Debug)]
enum SocketInner {
    Listener(TcpListener),
    Stream(TcpStream),
    Datagram(UdpSocket),
}

/// OS socket handle plus the addressing facts the host cares about.
#[derive(Debug)]
pub struct ChannelSocket {
    inner: SocketInner,
    local_port: u16,
    peer: Option<SocketAddr>,
    /// Send/receive buffer size, inherited by accepted streams.
    buffer_bytes: usize,
}

impl ChannelSocket {
    /// Open a socket bound to `127.0.0.1:port` (`0` picks an ephemeral port).
    ///
    /// TCP sockets are put in the listening state; UDP sockets are just bound.
    /// Failures here are resource or privilege problems and are not retried.
    pub fn open(kind: SocketKind, port: u16, buffer_bytes: usize) -> Result<Self> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let socket = match kind {
            SocketKind::Tcp => {
                let listener = TcpListener::bind(addr).map_err(|e| {
                    HostError::Socket(format!("Failed to listen on {}: {}", addr, e))
                })?;
                listener.set_nonblocking(true)?;
                let local_port = listener.local_addr()?.port();
                Self {
                    inner: SocketInner::Listener(listener),
                    local_port,
                    peer: None,
                    buffer_bytes,
                }
            }
            SocketKind::Udp => {
                let socket = UdpSocket::bind(addr).map_err(|e| {
                    HostError::Socket(format!("Failed to bind UDP {}: {}", addr, e))
                })?;
                socket.set_nonblocking(true)?;
                let local_port = socket.local_addr()?.port();
                Self {
                    inner: SocketInner::Datagram(socket),
                    local_port,
                    peer: None,
                    buffer_bytes,
                }
            }
        };

        set_buffer_sizes(socket.raw(), buffer_bytes);
        tracing::debug!("Opened {:?} socket on port {}", kind, socket.local_port);
        Ok(socket)
    }

    /// Blocking connect, for worker bootstrap and tests only.
    ///
    /// The returned socket is switched to non-blocking mode.
    pub fn connect_blocking(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| HostError::Socket(format!("Failed to resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| HostError::Socket(format!("No address for {}:{}", host, port)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| HostError::Socket(format!("Failed to connect to {}: {}", addr, e)))?;
        Self::from_stream(stream, DEFAULT_SOCKET_BUFFER_BYTES)
    }

    /// Accept one pending peer. `Ok(None)` when nobody is waiting.
    pub fn accept(&self) -> Result<Option<ChannelSocket>> {
        let SocketInner::Listener(listener) = &self.inner else {
            return Err(HostError::InvalidState(
                "accept() called on a socket that is not listening".to_string(),
            ));
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted connection from {} on port {}", peer, self.local_port);
                Ok(Some(Self::from_stream(stream, self.buffer_bytes)?))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(HostError::Socket(format!(
                "accept() failed on port {}: {}",
                self.local_port, e
            ))),
        }
    }

    fn from_stream(stream: TcpStream, buffer_bytes: usize) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let local_port = stream.local_addr()?.port();
        let peer = stream.peer_addr().ok();
        let socket = Self {
            inner: SocketInner::Stream(stream),
            local_port,
            peer,
            buffer_bytes,
        };
        set_buffer_sizes(socket.raw(), buffer_bytes);
        Ok(socket)
    }

    pub fn kind(&self) -> SocketKind {
        match self.inner {
            SocketInner::Listener(_) | SocketInner::Stream(_) => SocketKind::Tcp,
            SocketInner::Datagram(_) => SocketKind::Udp,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.inner, SocketInner::Listener(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.inner, SocketInner::Stream(_))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    pub fn raw(&self) -> RawSocket {
        match &self.inner {
            SocketInner::Listener(l) => l.poll_handle(),
            SocketInner::Stream(s) => s.poll_handle(),
            SocketInner::Datagram(d) => d.poll_handle(),
        }
    }

    /// Hand over the connected stream.
    pub(crate) fn into_stream(self) -> Result<TcpStream> {
        match self.inner {
            SocketInner::Stream(stream) => Ok(stream),
            _ => Err(HostError::InvalidState(
                "socket is not a connected stream".to_string(),
            )),
        }
    }
}

#[cfg(unix)]
fn set_buffer_sizes(raw: RawSocket, bytes: usize) {
    let size = bytes.min(i32::MAX as usize) as libc::c_int;
    for option in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        // SAFETY: `raw` is a live socket owned by the caller; the option value
        // points at a c_int that outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                option,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            tracing::debug!(
                "setsockopt({}) failed: {}",
                option,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(windows)]
fn set_buffer_sizes(raw: RawSocket, bytes: usize) {
    use windows_sys::Win32::Networking::WinSock::{SO_RCVBUF, SO_SNDBUF, SOL_SOCKET, setsockopt};

    let size = bytes.min(i32::MAX as usize) as i32;
    for option in [SO_SNDBUF, SO_RCVBUF] {
        // SAFETY: `raw` is a live socket owned by the caller.
        let rc = unsafe {
            setsockopt(
                raw as usize,
                SOL_SOCKET,
                option,
                &size as *const i32 as *const u8,
                std::mem::size_of::<i32>() as i32,
            )
        };
        if rc != 0 {
            tracing::debug!("setsockopt({}) failed: {}", option, io::Error::last_os_error());
        }
    }
}
