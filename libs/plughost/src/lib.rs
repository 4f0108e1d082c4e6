// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Plughost - Out-of-process plugin hosting.
//!
//! A [`PluginHost`] launches one worker process, connects to it over a
//! loopback socket, negotiates message classes, and supervises it until it
//! exits. Large payloads travel through named shared-memory regions the host
//! creates and the worker maps. A [`Supervisor`] drives many hosts over a
//! single [`Reactor`](reactor::Reactor).

pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod message;
pub mod reactor;
pub mod shm;
pub mod subprocess;
pub mod supervisor;
pub mod worker;

pub use config::{HostConfig, PlughostConfig, ReactorConfig, ShmBackendKind};
pub use error::{HostError, Result};
pub use host::{FailureReason, HostEvent, HostState, PluginHost};
pub use message::{ClassVersion, Message, MessageClassVersions, Value};
pub use shm::SharedMemoryRegion;
pub use subprocess::{ProcessLauncher, StdProcessLauncher, WorkerProcess};
pub use supervisor::{HostId, Supervisor};
pub use worker::WorkerConnection;

/// Library version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
