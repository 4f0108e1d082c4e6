// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Structured messages and their line-delimited wire form.
//!
//! A frame is one JSON object terminated by `\n`:
//!
//! ```text
//! {"class":"internal","name":"shm_add","params":{"name":{"string":"1234_0"},"size":{"integer":65536}}}
//! ```
//!
//! JSON escapes control characters inside strings, so a raw newline can only
//! ever be the frame terminator, whatever the parameter values contain.

mod value;
mod versions;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

pub use value::Value;
pub use versions::{ClassVersion, MessageClassVersions};

/// Frame terminator.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Largest frame accepted before the terminator shows up.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One unit of communication between host and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    class: String,
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check both class and name at once.
    pub fn is(&self, class: &str, name: &str) -> bool {
        self.class == class && self.name == name
    }

    /// Reset to a new class/name, dropping all parameters.
    pub fn set_message(&mut self, class: impl Into<String>, name: impl Into<String>) {
        self.class = class.into();
        self.name = name.into();
        self.params.clear();
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    /// Builder form of [`set_value`](Self::set_value).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_value(key, value);
        self
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(Value::as_int)
    }

    pub fn get_real(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(Value::as_real)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    pub fn get_blob(&self, key: &str) -> Option<&[u8]> {
        self.value(key).and_then(Value::as_blob)
    }

    pub fn get_map(&self, key: &str) -> Option<&BTreeMap<String, Value>> {
        self.value(key).and_then(Value::as_map)
    }
}

/// Serialize a message into one frame, terminator included.
pub fn generate(message: &Message) -> Result<String> {
    if message.class.is_empty() || message.name.is_empty() {
        return Err(HostError::Protocol(
            "message class and name must not be empty".to_string(),
        ));
    }
    if let Some((key, _)) = message.params.iter().find(|(_, v)| !v.is_frameable()) {
        return Err(HostError::Protocol(format!(
            "parameter '{}' of {}:{} holds a non-finite real",
            key, message.class, message.name
        )));
    }

    let mut frame = serde_json::to_string(message)
        .map_err(|e| HostError::Protocol(format!("Failed to serialize message: {}", e)))?;
    frame.push(FRAME_DELIMITER as char);
    Ok(frame)
}

/// Parse one frame. A trailing terminator (and `\r`) is accepted but not required.
pub fn parse(text: &str) -> Result<Message> {
    let line = text
        .strip_suffix('\n')
        .unwrap_or(text)
        .trim_end_matches('\r');

    if line.trim().is_empty() {
        return Err(HostError::Protocol("empty frame".to_string()));
    }

    let message: Message = serde_json::from_str(line)
        .map_err(|e| HostError::Protocol(format!("Failed to parse frame: {}", e)))?;

    if message.class.is_empty() || message.name.is_empty() {
        return Err(HostError::Protocol(
            "frame has an empty class or name".to_string(),
        ));
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut nested = BTreeMap::new();
        nested.insert("media".to_string(), Value::from("1.1"));
        Message::new("base", "init")
            .with("foo", "line one\nline two\r\n{\"json\":true}")
            .with("count", 42i64)
            .with("ratio", 0.25)
            .with("flag", true)
            .with("bytes", vec![0u8, b'\n', 0xFF])
            .with("versions", Value::Map(nested))
    }

    #[test]
    fn test_round_trip() {
        let message = sample();
        let frame = generate(&message).unwrap();
        assert_eq!(parse(&frame).unwrap(), message);
    }

    #[test]
    fn test_frame_has_single_terminator() {
        let frame = generate(&sample()).unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.bytes().filter(|b| *b == FRAME_DELIMITER).count(), 1);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = Message::new("base", "x").with("b", 1i64).with("a", 2i64);
        let b = Message::new("base", "x").with("a", 2i64).with("b", 1i64);
        assert_eq!(generate(&a).unwrap(), generate(&b).unwrap());
    }

    #[test]
    fn test_parse_without_terminator() {
        let message = parse(r#"{"class":"base","name":"idle"}"#).unwrap();
        assert!(message.is("base", "idle"));
        assert!(message.params().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("\n").is_err());
        assert!(parse("base\nidle\n").is_err());
        assert!(parse(r#"{"class":"","name":"idle"}"#).is_err());
        assert!(parse(r#"{"class":"base","name":"x","params":{"k":{"blob":"***"}}}"#).is_err());
    }

    #[test]
    fn test_generate_rejects_non_finite() {
        let message = Message::new("base", "x").with("r", f64::INFINITY);
        assert!(generate(&message).is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let message = sample();
        assert_eq!(message.get_int("count"), Some(42));
        assert_eq!(message.get_real("count"), Some(42.0));
        assert_eq!(message.get_str("count"), None);
        assert_eq!(message.get_bool("flag"), Some(true));
        assert_eq!(message.get_blob("bytes"), Some(&[0u8, b'\n', 0xFF][..]));
        assert!(message.get_map("versions").is_some());
        assert!(!message.has_value("missing"));
    }

    #[test]
    fn test_set_message_clears_params() {
        let mut message = sample();
        message.set_message("base", "idle");
        assert!(message.is("base", "idle"));
        assert!(message.params().is_empty());
    }
}
