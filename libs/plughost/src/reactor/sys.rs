// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Readiness polling over raw socket handles.

use std::io;
use std::time::Duration;

#[cfg(unix)]
pub type RawSocket = std::os::unix::io::RawFd;

#[cfg(windows)]
pub type RawSocket = std::os::windows::io::RawSocket;

/// Anything that can hand out the OS handle to poll on.
pub trait AsPollHandle {
    fn poll_handle(&self) -> RawSocket;
}

#[cfg(unix)]
impl<T: std::os::unix::io::AsRawFd> AsPollHandle for T {
    fn poll_handle(&self) -> RawSocket {
        self.as_raw_fd()
    }
}

#[cfg(windows)]
impl<T: std::os::windows::io::AsRawSocket> AsPollHandle for T {
    fn poll_handle(&self) -> RawSocket {
        self.as_raw_socket()
    }
}

fn timeout_millis(timeout: Duration) -> i32 {
    // Round up so a sub-millisecond timeout still waits instead of spinning.
    let millis = timeout.as_micros().div_ceil(1000);
    millis.min(i32::MAX as u128) as i32
}

/// A fixed set of handles waited on for readability.
#[cfg(unix)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

#[cfg(unix)]
impl PollSet {
    pub fn new(handles: &[RawSocket]) -> Self {
        let fds = handles
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        Self { fds }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait up to `timeout`; returns indices of handles that are readable,
    /// hung up or in error.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<usize>> {
        if self.fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }

        for fd in &mut self.fds {
            fd.revents = 0;
        }

        // SAFETY: `fds` is a live, correctly sized array of pollfd.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let ready_mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
        Ok(self
            .fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| fd.revents & ready_mask != 0)
            .map(|(i, _)| i)
            .collect())
    }
}

#[cfg(windows)]
pub struct PollSet {
    fds: Vec<windows_sys::Win32::Networking::WinSock::WSAPOLLFD>,
}

#[cfg(windows)]
impl PollSet {
    pub fn new(handles: &[RawSocket]) -> Self {
        use windows_sys::Win32::Networking::WinSock::{POLLRDNORM, WSAPOLLFD};

        let fds = handles
            .iter()
            .map(|&socket| WSAPOLLFD {
                fd: socket as usize,
                events: POLLRDNORM,
                revents: 0,
            })
            .collect();
        Self { fds }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<usize>> {
        use windows_sys::Win32::Networking::WinSock::{
            POLLERR, POLLHUP, POLLNVAL, POLLRDNORM, SOCKET_ERROR, WSAPoll,
        };

        // WSAPoll rejects an empty set.
        if self.fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }

        for fd in &mut self.fds {
            fd.revents = 0;
        }

        // SAFETY: `fds` is a live, correctly sized array of WSAPOLLFD.
        let rc = unsafe {
            WSAPoll(
                self.fds.as_mut_ptr(),
                self.fds.len() as u32,
                timeout_millis(timeout),
            )
        };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }

        let ready_mask = POLLRDNORM | POLLHUP | POLLERR | POLLNVAL;
        Ok(self
            .fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| fd.revents & ready_mask != 0)
            .map(|(i, _)| i)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_sub_millisecond_timeout_rounds_up() {
        assert_eq!(timeout_millis(Duration::from_micros(10)), 1);
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_millis(250)), 250);
    }

    #[test]
    fn test_wait_reports_readable_handle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (quiet, _) = listener.accept().unwrap();
        let mut other = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (busy, _) = listener.accept().unwrap();

        let mut set = PollSet::new(&[quiet.poll_handle(), busy.poll_handle()]);
        assert!(set.wait(Duration::from_millis(10)).unwrap().is_empty());

        other.write_all(b"x").unwrap();
        assert_eq!(set.wait(Duration::from_secs(2)).unwrap(), vec![1]);

        client.write_all(b"y").unwrap();
        let mut ready = Vec::new();
        for _ in 0..50 {
            ready = set.wait(Duration::from_millis(50)).unwrap();
            if ready.len() == 2 {
                break;
            }
        }
        assert_eq!(ready, vec![0, 1]);
    }
}
