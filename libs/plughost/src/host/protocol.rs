// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The `internal` message class spoken between host and worker.

use crate::message::{ClassVersion, Message, MessageClassVersions};

/// Reserved for the host's own protocol; owners may not send it.
pub const INTERNAL_CLASS: &str = "internal";
pub const INTERNAL_VERSION: ClassVersion = ClassVersion::new(1, 0);

/// A message carrying this key puts the host in the blocked state.
pub const BLOCKING_REQUEST: &str = "blocking_request";
/// An outbound message carrying this key releases it.
pub const BLOCKING_RESPONSE: &str = "blocking_response";

pub const HELLO: &str = "hello";
pub const LOAD_PLUGIN: &str = "load_plugin";
pub const LOAD_PLUGIN_RESPONSE: &str = "load_plugin_response";
pub const HEARTBEAT: &str = "heartbeat";
pub const SLEEP_TIME: &str = "sleep_time";
pub const SHM_ADD: &str = "shm_add";
pub const SHM_ADD_RESPONSE: &str = "shm_add_response";
pub const SHM_REMOVE: &str = "shm_remove";
pub const SHM_REMOVE_RESPONSE: &str = "shm_remove_response";
pub const SHUTDOWN_PLUGIN: &str = "shutdown_plugin";

fn internal(name: &str) -> Message {
    Message::new(INTERNAL_CLASS, name)
}

pub fn hello(versions: &MessageClassVersions) -> Message {
    internal(HELLO).with("versions", versions.to_value())
}

pub fn load_plugin(file: &str) -> Message {
    internal(LOAD_PLUGIN).with("file", file)
}

pub fn load_plugin_response(plugin_version: &str, error: Option<&str>) -> Message {
    let message = internal(LOAD_PLUGIN_RESPONSE).with("plugin_version", plugin_version);
    match error {
        Some(error) => message.with("error", error),
        None => message,
    }
}

pub fn heartbeat(cpu_usage: f64) -> Message {
    internal(HEARTBEAT).with("cpu_usage", cpu_usage)
}

pub fn sleep_time(seconds: f64) -> Message {
    internal(SLEEP_TIME).with("time", seconds)
}

pub fn shm_add(name: &str, size: usize) -> Message {
    internal(SHM_ADD)
        .with("name", name)
        .with("size", size as i64)
}

pub fn shm_add_response(name: &str, error: Option<&str>) -> Message {
    let message = internal(SHM_ADD_RESPONSE).with("name", name);
    match error {
        Some(error) => message.with("error", error),
        None => message,
    }
}

pub fn shm_remove(name: &str) -> Message {
    internal(SHM_REMOVE).with("name", name)
}

pub fn shm_remove_response(name: &str) -> Message {
    internal(SHM_REMOVE_RESPONSE).with("name", name)
}

pub fn shutdown_plugin() -> Message {
    internal(SHUTDOWN_PLUGIN)
}
