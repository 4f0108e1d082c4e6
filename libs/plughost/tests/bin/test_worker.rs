// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Worker fixture for the integration tests and CLI demos.
//!
//! Usage: `plughost-test-worker <port> [mode]`
//!
//! Modes:
//! - `normal` (default): load, heartbeat, answer `base:ping` with `base:pong`.
//! - `exit`: exit with code 3 before connecting.
//! - `hang`: load, then stop reading and heartbeating.
//! - `bad-hello`: send a payload message instead of `hello`.
//! - `count`: bump byte 0 of every mapped region on each tick.
//! - `fill=0xNN`: fill each region with a byte before acknowledging it.
//! - `ignore-shutdown`: keep running after `shutdown_plugin`.
//! - `block`: send a blocking request right after loading.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use plughost::channel::{Channel, ChannelSocket, MessageQueue};
use plughost::host::protocol::{self, INTERNAL_CLASS};
use plughost::{ClassVersion, Message, MessageClassVersions, WorkerConnection};

const TICK: Duration = Duration::from_millis(20);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Exit,
    Hang,
    BadHello,
    Count,
    Fill(u8),
    IgnoreShutdown,
    Block,
}

impl Mode {
    fn parse(arg: Option<&str>) -> Result<Self> {
        let Some(arg) = arg else {
            return Ok(Self::Normal);
        };
        if let Some(byte) = arg.strip_prefix("fill=") {
            let digits = byte.trim_start_matches("0x");
            let byte = u8::from_str_radix(digits, 16)
                .with_context(|| format!("invalid fill byte '{}'", byte))?;
            return Ok(Self::Fill(byte));
        }
        Ok(match arg {
            "normal" => Self::Normal,
            "exit" => Self::Exit,
            "hang" => Self::Hang,
            "bad-hello" => Self::BadHello,
            "count" => Self::Count,
            "ignore-shutdown" => Self::IgnoreShutdown,
            "block" => Self::Block,
            other => bail!("unknown mode '{}'", other),
        })
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let port: u16 = args
        .first()
        .ok_or_else(|| anyhow!("missing port argument"))?
        .parse()
        .context("port must be a number")?;
    let mode = Mode::parse(args.get(1).map(String::as_str))?;

    match mode {
        Mode::Exit => std::process::exit(3),
        Mode::BadHello => bad_hello(port),
        _ => serve(port, mode),
    }
}

fn bad_hello(port: u16) -> Result<()> {
    let socket = ChannelSocket::connect_blocking("127.0.0.1", port, Duration::from_secs(5))?;
    let mut channel = Channel::new(socket, Arc::new(MessageQueue::new()), "bad-hello")?;
    channel.send(&Message::new("base", "surprise"))?;
    while !channel.is_closed() {
        channel.pump_output()?;
        channel.pump_input();
        std::thread::sleep(TICK);
    }
    Ok(())
}

fn serve(port: u16, mode: Mode) -> Result<()> {
    let versions = MessageClassVersions::new().with("base", ClassVersion::new(1, 0));
    let mut worker = WorkerConnection::connect(port, versions)?;
    let mut loaded = false;
    let mut last_heartbeat = Instant::now();
    let started = Instant::now();

    loop {
        let message = worker.recv(TICK)?;

        if worker.is_closed() {
            tracing::info!("Host closed the connection");
            return Ok(());
        }

        if loaded && last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            let cpu = (started.elapsed().as_secs_f64() % 1.0) * 0.1;
            worker.send(&protocol::heartbeat(cpu))?;
            last_heartbeat = Instant::now();
        }

        if mode == Mode::Count {
            let names: Vec<String> = worker.shared_memory_names().map(str::to_string).collect();
            for name in names {
                if let Some(region) = worker.shared_memory(&name) {
                    let next = region.read_byte(0)?.saturating_add(1);
                    region.write(0, &[next])?;
                }
            }
        }

        let Some(message) = message else {
            continue;
        };

        if let Mode::Fill(byte) = mode {
            if message.is(INTERNAL_CLASS, protocol::SHM_ADD) {
                let name = message.get_str("name").unwrap_or_default().to_string();
                let size = message.get_int("size").unwrap_or(0).max(0) as usize;
                let error = worker
                    .attach_shared_memory(&name, size)
                    .and_then(|region| region.fill(byte))
                    .err()
                    .map(|e| e.to_string());
                worker.send(&protocol::shm_add_response(&name, error.as_deref()))?;
                continue;
            }
        }

        if worker.serve_internal(&message)? {
            continue;
        }

        if message.is(INTERNAL_CLASS, protocol::LOAD_PLUGIN) {
            let file = message.get_str("file").unwrap_or_default();
            if file == "missing" {
                worker.send(&protocol::load_plugin_response("", Some("plugin file not found")))?;
                continue;
            }
            worker.send(&protocol::load_plugin_response(plughost::VERSION, None))?;
            loaded = true;
            tracing::info!("Loaded '{}'", file);

            match mode {
                Mode::Hang => {
                    worker.flush(Duration::from_secs(1))?;
                    loop {
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
                Mode::Block => {
                    worker.send(
                        &Message::new("base", "query").with(protocol::BLOCKING_REQUEST, true),
                    )?;
                }
                _ => {}
            }
        } else if message.is(INTERNAL_CLASS, protocol::SHUTDOWN_PLUGIN) {
            if mode == Mode::IgnoreShutdown {
                tracing::info!("Ignoring shutdown request");
                continue;
            }
            worker.flush(Duration::from_secs(1))?;
            return Ok(());
        } else if message.is("base", "ping") {
            let mut pong = Message::new("base", "pong");
            if let Some(n) = message.get_int("n") {
                pong.set_value("n", n);
            }
            worker.send(&pong)?;
        }
    }
}
