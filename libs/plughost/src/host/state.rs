// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fmt;

/// Host lifecycle state. Declaration order is lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HostState {
    #[default]
    Uninitialized,
    Initialized,
    Listening,
    Launched,
    Connected,
    Hello,
    Loading,
    Running,
    LaunchFailure,
    Error,
    Cleanup,
    Exiting,
    Done,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initialized => "INITIALIZED",
            Self::Listening => "LISTENING",
            Self::Launched => "LAUNCHED",
            Self::Connected => "CONNECTED",
            Self::Hello => "HELLO",
            Self::Loading => "LOADING",
            Self::Running => "RUNNING",
            Self::LaunchFailure => "LAUNCH_FAILURE",
            Self::Error => "ERROR",
            Self::Cleanup => "CLEANUP",
            Self::Exiting => "EXITING",
            Self::Done => "DONE",
        }
    }

    /// Still starting up, not yet running.
    pub fn is_loading(&self) -> bool {
        *self <= Self::Loading
    }

    /// Failure, cleanup or exit in progress, or finished.
    pub fn is_tearing_down(&self) -> bool {
        *self >= Self::LaunchFailure
    }

    pub fn is_done(&self) -> bool {
        *self == Self::Done
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
