// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fmt;

use super::HostState;
use crate::message::Message;

/// Why a host gave up on its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ListenFailed(String),
    SpawnFailed(String),
    LaunchTimeout,
    ConnectionLost,
    ProcessExited(String),
    HandshakeRejected(String),
    LoadFailed(String),
    MalformedMessage(String),
    Lockup,
    BlockedTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListenFailed(e) => write!(f, "could not listen: {}", e),
            Self::SpawnFailed(e) => write!(f, "could not spawn worker: {}", e),
            Self::LaunchTimeout => write!(f, "worker did not finish launching in time"),
            Self::ConnectionLost => write!(f, "connection to worker lost"),
            Self::ProcessExited(status) => write!(f, "worker exited ({})", status),
            Self::HandshakeRejected(e) => write!(f, "handshake rejected: {}", e),
            Self::LoadFailed(e) => write!(f, "plugin failed to load: {}", e),
            Self::MalformedMessage(e) => write!(f, "malformed message: {}", e),
            Self::Lockup => write!(f, "worker stopped responding"),
            Self::BlockedTimeout => write!(f, "blocking request was never answered"),
        }
    }
}

/// What the owner learns from one [`PluginHost::idle`](super::PluginHost::idle).
///
/// Exactly one of `LaunchFailed`, `ProcessDied` or `Exited` is ever emitted
/// per host, on entry to `DONE`.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A message from the worker for the owner.
    Message(Message),
    StateChanged { from: HostState, to: HostState },
    /// Failed before reaching `RUNNING`.
    LaunchFailed { reason: FailureReason },
    /// Failed after reaching `RUNNING`.
    ProcessDied { reason: FailureReason },
    /// Shut down at the owner's request.
    Exited,
}

impl HostEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LaunchFailed { .. } | Self::ProcessDied { .. } | Self::Exited
        )
    }
}
