// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! One supervised worker process.
//!
//! [`PluginHost`] drives a worker from launch to exit:
//!
//! ```text
//! UNINITIALIZED → INITIALIZED → LISTENING → LAUNCHED → CONNECTED → HELLO → LOADING → RUNNING
//!                                   │            │           │         │        │          │
//!                                   └────────────┴── LAUNCH_FAILURE ───┴────────┘        ERROR
//!                                                          └──────────→ CLEANUP ←──────────┘
//!                                                                          ↓
//!                                                                       EXITING → DONE
//! ```
//!
//! Everything happens inside [`PluginHost::idle`], which never blocks and
//! never returns an error: failures become a [`FailureReason`] and end in a
//! single terminal [`HostEvent`].

mod event;
pub mod protocol;
mod state;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelSocket, EarlyHandler, MessageQueue, SocketKind};
use crate::config::{self, HostConfig, deadline_after};
use crate::error::{HostError, Result};
use crate::message::{ClassVersion, Message, MessageClassVersions};
use crate::reactor::{ReactorHandle, RegistrationId};
use crate::shm::{self, SharedMemoryRegion, ShmBackend};
use crate::subprocess::{ProcessLauncher, WorkerProcess};

pub use event::{FailureReason, HostEvent};
pub use state::HostState;

use protocol::{BLOCKING_REQUEST, BLOCKING_RESPONSE, INTERNAL_CLASS, INTERNAL_VERSION};

/// Bound on transitions taken in one `idle()`.
const MAX_STEPS_PER_IDLE: usize = 16;

struct RegionEntry {
    region: SharedMemoryRegion,
    acknowledged: bool,
    removing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitPhase {
    Waiting,
    Killed,
}

pub struct PluginHost {
    config: HostConfig,
    label: String,
    state: HostState,

    launcher: Arc<dyn ProcessLauncher>,
    reactor: Option<ReactorHandle>,
    registration: Option<RegistrationId>,
    shm_backend: Arc<dyn ShmBackend>,

    listener: Option<ChannelSocket>,
    channel: Option<Channel>,
    queue: Arc<MessageQueue>,
    early_handler: Option<EarlyHandler>,
    process: Option<Box<dyn WorkerProcess>>,
    pid: Option<u32>,
    port: Option<u16>,

    negotiated: MessageClassVersions,
    plugin_version: Option<String>,
    cpu_usage: f64,
    sleep_time: Duration,

    debug: bool,
    disable_timeout: bool,
    launch_timeout: Duration,
    lockup_timeout: Duration,
    blocked: bool,
    blocked_since: Option<Instant>,
    launch_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    last_heartbeat: Option<Instant>,
    phase_deadline: Option<Instant>,
    exit_phase: ExitPhase,

    regions: BTreeMap<String, RegionEntry>,
    failure: Option<FailureReason>,
    reached_running: bool,
    shutdown_requested: bool,
    events: Vec<HostEvent>,
}

impl PluginHost {
    /// Build a host for `config`. With a reactor, the host registers its
    /// channel there and lets the reactor pump it; without one, `idle()`
    /// pumps the channel itself.
    pub fn new(
        config: HostConfig,
        reactor: Option<ReactorHandle>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        let shm_backend = shm::backend_for(config.shm_backend)?;

        Ok(Self {
            label: config.effective_label(),
            state: HostState::Uninitialized,
            launcher,
            reactor,
            registration: None,
            shm_backend,
            listener: None,
            channel: None,
            queue: Arc::new(MessageQueue::new()),
            early_handler: None,
            process: None,
            pid: None,
            port: None,
            negotiated: MessageClassVersions::new(),
            plugin_version: None,
            cpu_usage: 0.0,
            sleep_time: config.sleep_time(),
            debug: config.debug,
            disable_timeout: config.disable_timeout,
            launch_timeout: config.launch_timeout(),
            lockup_timeout: config.lockup_timeout(),
            blocked: false,
            blocked_since: None,
            launch_deadline: None,
            heartbeat_deadline: None,
            last_heartbeat: None,
            phase_deadline: None,
            exit_phase: ExitPhase::Waiting,
            regions: BTreeMap::new(),
            failure: None,
            reached_running: false,
            shutdown_requested: false,
            events: Vec::new(),
            config,
        })
    }

    pub fn init(&mut self) -> Result<()> {
        if self.state != HostState::Uninitialized {
            return Err(HostError::InvalidState(format!(
                "init() called in state {}",
                self.state
            )));
        }
        self.transition(HostState::Initialized);
        Ok(())
    }

    /// Advance the host: pump the channel, consume inbound messages, run
    /// timers and whatever transition is pending.
    pub fn idle(&mut self) -> Vec<HostEvent> {
        if self.state != HostState::Done {
            self.pump();
            self.drain_queue();
            for _ in 0..MAX_STEPS_PER_IDLE {
                let before = self.state;
                self.step(Instant::now());
                if self.state == before {
                    break;
                }
            }
        }
        std::mem::take(&mut self.events)
    }

    // ---- owner operations ----

    /// Send a payload message. The class must have been negotiated and may
    /// not be `internal`.
    pub fn send_message(&mut self, message: &Message) -> Result<()> {
        if message.class() == INTERNAL_CLASS {
            return Err(HostError::Protocol(format!(
                "the '{}' message class is reserved for the host",
                INTERNAL_CLASS
            )));
        }
        if !matches!(self.state, HostState::Loading | HostState::Running) {
            return Err(HostError::InvalidState(format!(
                "cannot send messages in state {}",
                self.state
            )));
        }
        if !self.negotiated.contains(message.class()) {
            return Err(HostError::Protocol(format!(
                "message class '{}' was not negotiated with the worker",
                message.class()
            )));
        }

        self.send_raw(message)?;

        if message.has_value(BLOCKING_RESPONSE) && self.blocked {
            tracing::debug!("[{}] Blocking request answered", self.label);
            self.blocked = false;
            self.blocked_since = None;
            self.heartbeat_deadline = Some(deadline_after(Instant::now(), self.lockup_timeout));
        }
        Ok(())
    }

    /// Graceful shutdown: tear down without reporting a failure.
    pub fn request_shutdown(&mut self) {
        if self.state.is_tearing_down() || self.shutdown_requested {
            return;
        }
        tracing::info!("[{}] Shutdown requested in state {}", self.label, self.state);
        self.shutdown_requested = true;
    }

    /// Create a region and offer it to the worker. Only valid while running.
    pub fn add_shared_memory(&mut self, size: usize) -> Result<String> {
        if self.state != HostState::Running {
            return Err(HostError::InvalidState(format!(
                "cannot add shared memory in state {}",
                self.state
            )));
        }

        let region = SharedMemoryRegion::create(self.shm_backend.as_ref(), size)?;
        let name = region.name().to_string();
        if let Err(e) = self.send_raw(&protocol::shm_add(&name, size)) {
            destroy_region(&self.label, region);
            return Err(e);
        }

        tracing::info!("[{}] Added shared memory '{}' ({} bytes)", self.label, name, size);
        self.regions.insert(
            name.clone(),
            RegionEntry {
                region,
                acknowledged: false,
                removing: false,
            },
        );
        Ok(name)
    }

    /// Ask the worker to let go of a region. The region is destroyed when the
    /// worker acknowledges; a second request while one is pending is rejected.
    pub fn remove_shared_memory(&mut self, name: &str) -> Result<()> {
        let entry = self
            .regions
            .get(name)
            .ok_or_else(|| HostError::NotFound(format!("shared memory '{}'", name)))?;
        if entry.removing {
            return Err(HostError::InvalidState(format!(
                "removal of shared memory '{}' is already pending",
                name
            )));
        }
        if self.state != HostState::Running {
            return Err(HostError::InvalidState(format!(
                "cannot remove shared memory in state {}",
                self.state
            )));
        }

        self.send_raw(&protocol::shm_remove(name))?;
        if let Some(entry) = self.regions.get_mut(name) {
            entry.removing = true;
        }
        tracing::debug!("[{}] Requested removal of shared memory '{}'", self.label, name);
        Ok(())
    }

    pub fn shared_memory(&self, name: &str) -> Option<&SharedMemoryRegion> {
        self.regions.get(name).map(|entry| &entry.region)
    }

    pub fn shared_memory_mut(&mut self, name: &str) -> Option<&mut SharedMemoryRegion> {
        self.regions.get_mut(name).map(|entry| &mut entry.region)
    }

    /// Size of a region, 0 when there is no such region.
    pub fn shared_memory_size(&self, name: &str) -> usize {
        self.shared_memory(name).map_or(0, SharedMemoryRegion::size)
    }

    /// Whether the worker confirmed it mapped the region.
    pub fn is_shared_memory_acknowledged(&self, name: &str) -> bool {
        self.regions.get(name).is_some_and(|entry| entry.acknowledged)
    }

    pub fn shared_memory_names(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }

    pub fn plugin_version(&self) -> Option<&str> {
        self.plugin_version.as_deref()
    }

    pub fn message_class_version(&self, class: &str) -> Option<ClassVersion> {
        self.negotiated.get(class)
    }

    pub fn negotiated_classes(&self) -> &MessageClassVersions {
        &self.negotiated
    }

    /// Last CPU usage the worker reported in a heartbeat.
    pub fn cpu_usage(&self) -> f64 {
        self.cpu_usage
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Change how often the worker should idle. Sent to a running worker when
    /// the value changes, or always with `force`.
    pub fn set_sleep_time(&mut self, seconds: f64, force: bool) {
        let sleep_time = config::secs(seconds);
        let changed = sleep_time != self.sleep_time;
        self.sleep_time = sleep_time;

        if (changed || force) && self.state == HostState::Running {
            if let Err(e) = self.send_raw(&protocol::sleep_time(sleep_time.as_secs_f64())) {
                tracing::warn!("[{}] Failed to send sleep time: {}", self.label, e);
            }
        }
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }

    pub fn set_disable_timeout(&mut self, disable: bool) {
        self.disable_timeout = disable;
        if !disable && self.state == HostState::Running {
            self.heartbeat_deadline = Some(deadline_after(Instant::now(), self.lockup_timeout));
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_launch_timeout(&mut self, timeout: Duration) {
        self.launch_timeout = timeout;
    }

    pub fn set_lockup_timeout(&mut self, timeout: Duration) {
        self.lockup_timeout = timeout;
        if self.state == HostState::Running {
            self.heartbeat_deadline = Some(deadline_after(Instant::now(), timeout));
        }
    }

    /// Install a handler that sees each message as soon as it is parsed,
    /// possibly on the reactor's read thread. Returning `true` consumes it.
    pub fn set_early_handler<F>(&mut self, handler: F)
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let handler: EarlyHandler = Arc::new(handler);
        if let Some(channel) = &self.channel {
            channel.inbound().set_early_handler(Some(handler.clone()));
        }
        self.early_handler = Some(handler);
    }

    pub fn clear_early_handler(&mut self) {
        if let Some(channel) = &self.channel {
            channel.inbound().set_early_handler(None);
        }
        self.early_handler = None;
    }

    /// Drop the connection to the worker. The state machine notices the
    /// missing channel on its next step.
    pub fn kill_sockets(&mut self) {
        tracing::info!("[{}] Killing sockets", self.label);
        self.listener = None;
        self.teardown_channel();
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn is_running(&self) -> bool {
        self.state == HostState::Running
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Waiting on a worker request that the owner has not answered yet.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    // ---- state machine ----

    fn step(&mut self, now: Instant) {
        let startup = self.state >= HostState::Initialized && self.state <= HostState::Running;
        if self.shutdown_requested && startup {
            self.transition(HostState::Cleanup);
            return;
        }

        match self.state {
            HostState::Uninitialized => {
                if self.shutdown_requested {
                    self.transition(HostState::Done);
                }
            }
            HostState::Initialized => self.listen(),
            HostState::Listening => self.launch(now),
            HostState::Launched => self.accept_worker(now),
            HostState::Connected | HostState::Loading => {
                let _ = self.check_connection() || self.check_launch_deadline(now);
            }
            HostState::Hello => self.send_load_request(),
            HostState::Running => self.check_running(now),
            HostState::LaunchFailure | HostState::Error => self.transition(HostState::Cleanup),
            HostState::Cleanup => self.step_cleanup(now),
            HostState::Exiting => self.step_exiting(now),
            HostState::Done => {}
        }
    }

    fn transition(&mut self, to: HostState) {
        let from = self.state;
        if from == to {
            return;
        }
        tracing::info!("[{}] {} -> {}", self.label, from, to);
        self.state = to;
        self.events.push(HostEvent::StateChanged { from, to });

        match to {
            HostState::Running => self.enter_running(),
            HostState::Cleanup => self.enter_cleanup(),
            HostState::Exiting => self.enter_exiting(),
            HostState::Done => self.enter_done(),
            _ => {}
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        if self.state.is_tearing_down() {
            tracing::debug!("[{}] Ignoring '{}' during {}", self.label, reason, self.state);
            return;
        }
        tracing::error!("[{}] {} (state {})", self.label, reason, self.state);
        self.failure = Some(reason);
        let target = if self.reached_running {
            HostState::Error
        } else {
            HostState::LaunchFailure
        };
        self.transition(target);
    }

    fn listen(&mut self) {
        match ChannelSocket::open(SocketKind::Tcp, 0, self.config.socket_buffer_bytes) {
            Ok(listener) => {
                self.port = Some(listener.local_port());
                self.listener = Some(listener);
                self.transition(HostState::Listening);
            }
            Err(e) => self.fail(FailureReason::ListenFailed(e.to_string())),
        }
    }

    fn launch(&mut self, now: Instant) {
        let port = self.port.unwrap_or_default();
        let mut args = Vec::with_capacity(self.config.args.len() + 1);
        args.push(port.to_string());
        args.extend(self.config.args.iter().cloned());

        match self
            .launcher
            .spawn(&self.config.launcher, &args, &self.config.env)
        {
            Ok(process) => {
                tracing::info!(
                    "[{}] Launched {} (pid {}) on port {}",
                    self.label,
                    self.config.launcher.display(),
                    process.pid(),
                    port
                );
                self.pid = Some(process.pid());
                self.process = Some(process);
                self.launch_deadline = Some(deadline_after(now, self.launch_timeout));
                self.transition(HostState::Launched);
            }
            Err(e) => self.fail(FailureReason::SpawnFailed(e.to_string())),
        }
    }

    fn accept_worker(&mut self, now: Instant) {
        let accepted = match &self.listener {
            Some(listener) => listener.accept(),
            None => Err(HostError::Socket("listening socket is gone".to_string())),
        };

        match accepted {
            Ok(Some(socket)) => match Channel::new(socket, self.queue.clone(), &self.label) {
                Ok(channel) => {
                    tracing::debug!("[{}] Worker connected", self.label);
                    channel.inbound().set_early_handler(self.early_handler.clone());
                    if let Some(reactor) = &self.reactor {
                        self.registration = Some(reactor.register(channel.inbound().clone()));
                    }
                    self.channel = Some(channel);
                    self.listener = None;
                    self.transition(HostState::Connected);
                }
                Err(e) => {
                    tracing::warn!("[{}] Could not set up channel: {}", self.label, e);
                    self.fail(FailureReason::ConnectionLost);
                }
            },
            Ok(None) => {
                let _ = self.check_process_exit() || self.check_launch_deadline(now);
            }
            Err(e) => self.fail(FailureReason::ListenFailed(e.to_string())),
        }
    }

    fn send_load_request(&mut self) {
        let hello = protocol::hello(&self.negotiated);
        let load = protocol::load_plugin(&self.config.plugin_file);
        match self.send_raw(&hello).and_then(|_| self.send_raw(&load)) {
            Ok(()) => self.transition(HostState::Loading),
            Err(e) => {
                tracing::warn!("[{}] Failed to send load request: {}", self.label, e);
                self.fail(FailureReason::ConnectionLost);
            }
        }
    }

    fn check_running(&mut self, now: Instant) {
        if self.check_connection() {
            return;
        }
        if self.debug || self.disable_timeout {
            return;
        }

        if self.blocked {
            let expired = self
                .blocked_since
                .is_some_and(|since| now.duration_since(since) >= self.config.blocked_timeout());
            if expired {
                self.fail(FailureReason::BlockedTimeout);
            }
            return;
        }

        if self.heartbeat_deadline.is_some_and(|deadline| now >= deadline) {
            self.fail(FailureReason::Lockup);
        }
    }

    /// Fail on a broken channel or a dead process. Returns true if it failed.
    fn check_connection(&mut self) -> bool {
        let (closed, malformed) = match &self.channel {
            Some(channel) => (channel.is_closed(), channel.malformed()),
            None => (true, None),
        };
        if let Some(reason) = malformed {
            self.fail(FailureReason::MalformedMessage(reason));
            return true;
        }
        if closed {
            self.fail(FailureReason::ConnectionLost);
            return true;
        }
        self.check_process_exit()
    }

    fn check_process_exit(&mut self) -> bool {
        let exit = match self.process.as_mut().map(|p| p.poll_exit()) {
            Some(Ok(exit)) => exit,
            Some(Err(e)) => {
                tracing::warn!("[{}] {}", self.label, e);
                None
            }
            None => None,
        };
        match exit {
            Some(exit) => {
                self.fail(FailureReason::ProcessExited(exit.to_string()));
                true
            }
            None => false,
        }
    }

    /// Debug mode suspends the launch deadline.
    fn check_launch_deadline(&mut self, now: Instant) -> bool {
        if self.debug {
            return false;
        }
        if self.launch_deadline.is_some_and(|deadline| now >= deadline) {
            self.fail(FailureReason::LaunchTimeout);
            return true;
        }
        false
    }

    fn enter_running(&mut self) {
        self.reached_running = true;
        self.launch_deadline = None;
        self.heartbeat_deadline = Some(deadline_after(Instant::now(), self.lockup_timeout));
        let seconds = self.sleep_time.as_secs_f64();
        if let Err(e) = self.send_raw(&protocol::sleep_time(seconds)) {
            tracing::warn!("[{}] Failed to send sleep time: {}", self.label, e);
        }
    }

    fn enter_cleanup(&mut self) {
        self.listener = None;
        self.phase_deadline = Some(deadline_after(Instant::now(), self.config.shm_remove_grace()));

        let channel_open = self.channel.as_ref().is_some_and(|c| !c.is_closed());
        if !channel_open {
            return;
        }

        let names: Vec<String> = self
            .regions
            .iter()
            .filter(|(_, entry)| !entry.removing)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            match self.send_raw(&protocol::shm_remove(&name)) {
                Ok(()) => {
                    if let Some(entry) = self.regions.get_mut(&name) {
                        entry.removing = true;
                    }
                }
                Err(e) => {
                    tracing::warn!("[{}] Could not request removal of '{}': {}", self.label, name, e);
                    break;
                }
            }
        }
    }

    fn step_cleanup(&mut self, now: Instant) {
        let pending = self.regions.values().filter(|entry| entry.removing).count();
        let channel_gone = self.channel.as_ref().is_none_or(|c| c.is_closed());
        let expired = self.phase_deadline.is_none_or(|deadline| now >= deadline);

        if pending == 0 || channel_gone || expired {
            if pending > 0 {
                tracing::warn!(
                    "[{}] Destroying {} shared memory region(s) without acknowledgement",
                    self.label,
                    pending
                );
            }
            self.destroy_all_regions();
            self.transition(HostState::Exiting);
        }
    }

    fn enter_exiting(&mut self) {
        self.exit_phase = ExitPhase::Waiting;
        self.phase_deadline = Some(deadline_after(Instant::now(), self.config.exit_timeout()));

        let channel_open = self.channel.as_ref().is_some_and(|c| !c.is_closed());
        let graceful = self.failure.is_none();
        let locked_up = matches!(self.failure, Some(FailureReason::Lockup));

        let result = if graceful && channel_open {
            self.send_raw(&protocol::shutdown_plugin())
        } else if locked_up {
            self.exit_phase = ExitPhase::Killed;
            self.with_process(|p| p.kill())
        } else {
            self.with_process(|p| p.request_terminate())
        };
        if let Err(e) = result {
            tracing::warn!("[{}] Failed to stop worker: {}", self.label, e);
        }
    }

    fn step_exiting(&mut self, now: Instant) {
        if let Some(channel) = &mut self.channel {
            let _ = channel.pump_output();
        }

        let exit = match self.process.as_mut().map(|p| p.poll_exit()) {
            None => {
                self.transition(HostState::Done);
                return;
            }
            Some(Ok(exit)) => exit,
            Some(Err(e)) => {
                tracing::warn!("[{}] Lost track of worker: {}", self.label, e);
                self.transition(HostState::Done);
                return;
            }
        };

        if exit.is_some() {
            self.transition(HostState::Done);
            return;
        }

        if self.phase_deadline.is_some_and(|deadline| now < deadline) {
            return;
        }

        match self.exit_phase {
            ExitPhase::Waiting => {
                tracing::warn!(
                    "[{}] Worker did not exit within {:?}, killing",
                    self.label,
                    self.config.exit_timeout()
                );
                if let Err(e) = self.with_process(|p| p.kill()) {
                    tracing::warn!("[{}] {}", self.label, e);
                }
                self.exit_phase = ExitPhase::Killed;
                self.phase_deadline = Some(deadline_after(now, self.config.exit_timeout()));
            }
            ExitPhase::Killed => {
                tracing::error!("[{}] Worker survived kill, giving up on it", self.label);
                self.transition(HostState::Done);
            }
        }
    }

    fn enter_done(&mut self) {
        self.teardown_channel();
        self.listener = None;
        self.destroy_all_regions();
        self.process = None;

        let event = match self.failure.clone() {
            Some(reason) if self.reached_running => HostEvent::ProcessDied { reason },
            Some(reason) => HostEvent::LaunchFailed { reason },
            None => HostEvent::Exited,
        };
        tracing::info!("[{}] Done: {:?}", self.label, event);
        self.events.push(event);
    }

    // ---- messages ----

    fn pump(&mut self) {
        let standalone = self.reactor.is_none();
        if let Some(channel) = &mut self.channel {
            if let Err(e) = channel.pump_output() {
                tracing::debug!("[{}] {}", self.label, e);
            }
            if standalone {
                channel.pump_input();
            }
        }
    }

    fn drain_queue(&mut self) {
        while let Some(message) = self.queue.pop() {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: Message) {
        let now = Instant::now();
        if message.has_value(BLOCKING_REQUEST) {
            tracing::debug!("[{}] Worker is blocked on {}:{}", self.label, message.class(), message.name());
            self.blocked = true;
            self.blocked_since = Some(now);
        }
        if self.state == HostState::Running {
            self.heartbeat_deadline = Some(deadline_after(now, self.lockup_timeout));
        }

        if message.class() == INTERNAL_CLASS {
            self.handle_internal(&message);
            return;
        }

        if self.state <= HostState::Connected {
            self.fail(FailureReason::HandshakeRejected(format!(
                "expected hello, got {}:{}",
                message.class(),
                message.name()
            )));
            return;
        }

        if !self.negotiated.contains(message.class()) {
            self.fail(FailureReason::MalformedMessage(format!(
                "{}:{} uses a class the worker never announced",
                message.class(),
                message.name()
            )));
            return;
        }

        self.events.push(HostEvent::Message(message));
    }

    fn handle_internal(&mut self, message: &Message) {
        match message.name() {
            protocol::HELLO => self.handle_hello(message),
            protocol::LOAD_PLUGIN_RESPONSE => self.handle_load_response(message),
            protocol::HEARTBEAT => {
                if let Some(cpu) = message.get_real("cpu_usage") {
                    self.cpu_usage = cpu;
                }
                self.last_heartbeat = Some(Instant::now());
            }
            protocol::SHM_ADD_RESPONSE => self.handle_shm_add_response(message),
            protocol::SHM_REMOVE_RESPONSE => self.handle_shm_remove_response(message),
            other => tracing::warn!("[{}] Unknown internal message '{}'", self.label, other),
        }
    }

    fn handle_hello(&mut self, message: &Message) {
        if self.state != HostState::Connected {
            tracing::warn!("[{}] Unexpected hello in state {}", self.label, self.state);
            return;
        }

        let peer = match message.value("versions") {
            Some(value) => MessageClassVersions::from_value(value),
            None => Err(HostError::Protocol("hello without 'versions'".to_string())),
        };

        let negotiated = peer.and_then(|peer| {
            // Payload classes are the owner's business; take the worker's word
            // for them and only hold `internal` to our own version.
            let mut ours = MessageClassVersions::new().with(INTERNAL_CLASS, INTERNAL_VERSION);
            for class in peer.classes().filter(|class| *class != INTERNAL_CLASS) {
                if let Some(version) = peer.get(class) {
                    ours.insert(class, version);
                }
            }
            let mut required = vec![INTERNAL_CLASS.to_string()];
            required.extend(self.config.required_classes.iter().cloned());
            ours.negotiate(&peer, &required)
        });

        match negotiated {
            Ok(negotiated) => {
                tracing::info!(
                    "[{}] Worker speaks: {}",
                    self.label,
                    negotiated
                        .classes()
                        .map(|c| format!("{} {}", c, negotiated.get(c).unwrap_or_default()))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.negotiated = negotiated;
                self.transition(HostState::Hello);
            }
            Err(e) => self.fail(FailureReason::HandshakeRejected(e.to_string())),
        }
    }

    fn handle_load_response(&mut self, message: &Message) {
        if self.state != HostState::Loading {
            tracing::warn!("[{}] Unexpected load response in state {}", self.label, self.state);
            return;
        }
        if let Some(error) = message.get_str("error") {
            self.fail(FailureReason::LoadFailed(error.to_string()));
            return;
        }

        self.plugin_version = message.get_str("plugin_version").map(str::to_string);
        tracing::info!(
            "[{}] Plugin loaded (version {})",
            self.label,
            self.plugin_version.as_deref().unwrap_or("unknown")
        );
        self.transition(HostState::Running);
    }

    fn handle_shm_add_response(&mut self, message: &Message) {
        let Some(name) = message.get_str("name") else {
            tracing::warn!("[{}] shm_add_response without a name", self.label);
            return;
        };

        if let Some(error) = message.get_str("error") {
            tracing::warn!("[{}] Worker could not map '{}': {}", self.label, name, error);
            // The worker never mapped it, so it is safe to destroy now.
            if let Some(entry) = self.regions.remove(name) {
                destroy_region(&self.label, entry.region);
            }
            return;
        }

        match self.regions.get_mut(name) {
            Some(entry) => {
                entry.acknowledged = true;
                tracing::debug!("[{}] Worker mapped '{}'", self.label, name);
            }
            None => tracing::warn!("[{}] shm_add_response for unknown '{}'", self.label, name),
        }
    }

    fn handle_shm_remove_response(&mut self, message: &Message) {
        let Some(name) = message.get_str("name") else {
            tracing::warn!("[{}] shm_remove_response without a name", self.label);
            return;
        };

        match self.regions.get(name) {
            Some(entry) if entry.removing => {
                if let Some(entry) = self.regions.remove(name) {
                    tracing::debug!("[{}] Worker released '{}'", self.label, name);
                    destroy_region(&self.label, entry.region);
                }
            }
            Some(_) => tracing::warn!("[{}] Unrequested remove ack for '{}'", self.label, name),
            None => tracing::warn!("[{}] shm_remove_response for unknown '{}'", self.label, name),
        }
    }

    // ---- helpers ----

    fn send_raw(&mut self, message: &Message) -> Result<()> {
        let channel = self.channel.as_mut().ok_or_else(|| {
            HostError::InvalidState("no connection to the worker".to_string())
        })?;
        channel.send(message)
    }

    fn with_process<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn WorkerProcess) -> Result<()>,
    {
        match self.process.as_mut() {
            Some(process) => f(process.as_mut()),
            None => Ok(()),
        }
    }

    fn teardown_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let (Some(reactor), Some(id)) = (&self.reactor, self.registration.take()) {
                reactor.unregister(id);
            }
            channel.shutdown();
        }
    }

    fn destroy_all_regions(&mut self) {
        for (_, entry) in std::mem::take(&mut self.regions) {
            destroy_region(&self.label, entry.region);
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.teardown_channel();
    }
}

fn destroy_region(label: &str, region: SharedMemoryRegion) {
    let name = region.name().to_string();
    if let Err(e) = region.destroy() {
        tracing::warn!("[{}] Failed to destroy shared memory '{}': {}", label, name, e);
    }
}
