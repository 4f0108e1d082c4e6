// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Drives many hosts over one shared reactor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{HostConfig, ReactorConfig};
use crate::error::Result;
use crate::host::{HostEvent, PluginHost};
use crate::reactor::Reactor;
use crate::subprocess::{ProcessLauncher, StdProcessLauncher};

/// Key for a host owned by a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

pub struct Supervisor {
    reactor: Reactor,
    launcher: Arc<dyn ProcessLauncher>,
    hosts: BTreeMap<HostId, PluginHost>,
    next_id: u64,
}

impl Supervisor {
    pub fn new(config: &ReactorConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new(config)?,
            launcher,
            hosts: BTreeMap::new(),
            next_id: 0,
        })
    }

    /// Supervisor that spawns real child processes.
    pub fn with_std_launcher(config: &ReactorConfig) -> Result<Self> {
        Self::new(config, Arc::new(StdProcessLauncher))
    }

    /// Create and initialize a host. The worker starts on the next `step()`.
    pub fn launch(&mut self, config: HostConfig) -> Result<HostId> {
        let mut host = PluginHost::new(config, Some(self.reactor.handle()), self.launcher.clone())?;
        host.init()?;

        let id = HostId(self.next_id);
        self.next_id += 1;
        tracing::info!("[{}] Supervising as {}", host.label(), id);
        self.hosts.insert(id, host);
        Ok(id)
    }

    pub fn host(&self, id: HostId) -> Option<&PluginHost> {
        self.hosts.get(&id)
    }

    pub fn host_mut(&mut self, id: HostId) -> Option<&mut PluginHost> {
        self.hosts.get_mut(&id)
    }

    pub fn host_ids(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.keys().copied()
    }

    /// Poll the reactor for at most the smallest host sleep time, idle every
    /// host, and drop hosts that reached `DONE`.
    ///
    /// Events come back tagged with their host; the terminal event of a
    /// reaped host is always included.
    pub fn step(&mut self) -> Result<Vec<(HostId, HostEvent)>> {
        let timeout = self
            .hosts
            .values()
            .map(PluginHost::sleep_time)
            .min()
            .unwrap_or(Duration::from_millis(10));
        self.reactor.poll(timeout)?;

        let mut events = Vec::new();
        for (id, host) in &mut self.hosts {
            events.extend(host.idle().into_iter().map(|event| (*id, event)));
        }

        let before = self.hosts.len();
        self.hosts.retain(|id, host| {
            if host.is_done() {
                tracing::debug!("[{}] Reaped {}", host.label(), id);
                return false;
            }
            true
        });
        if self.hosts.len() != before {
            tracing::debug!("Supervisor: {} host(s) remaining", self.hosts.len());
        }
        Ok(events)
    }

    pub fn request_shutdown_all(&mut self) {
        for host in self.hosts.values_mut() {
            host.request_shutdown();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }
}
