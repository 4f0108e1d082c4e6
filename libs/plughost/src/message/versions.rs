// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-class version announcements exchanged during the handshake.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::Value;
use crate::error::{HostError, Result};

/// A `major.minor` version. Same major means compatible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClassVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClassVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(&self, other: &ClassVersion) -> bool {
        self.major == other.major
    }
}

impl FromStr for ClassVersion {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                HostError::Protocol(format!("invalid message class version '{}'", s))
            })
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

impl fmt::Display for ClassVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Message class name → version, as announced by one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageClassVersions {
    versions: BTreeMap<String, ClassVersion>,
}

impl MessageClassVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, class: impl Into<String>, version: ClassVersion) -> Self {
        self.insert(class, version);
        self
    }

    pub fn insert(&mut self, class: impl Into<String>, version: ClassVersion) {
        self.versions.insert(class.into(), version);
    }

    pub fn get(&self, class: &str) -> Option<ClassVersion> {
        self.versions.get(class).copied()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.versions.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Encode as a `Map` value for the `versions` parameter.
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.versions
                .iter()
                .map(|(class, version)| (class.clone(), Value::String(version.to_string())))
                .collect(),
        )
    }

    /// Decode the `versions` parameter of a hello message.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_map().ok_or_else(|| {
            HostError::Protocol("'versions' must be a map of class to version".to_string())
        })?;

        let mut versions = Self::new();
        for (class, version) in map {
            let text = version.as_str().ok_or_else(|| {
                HostError::Protocol(format!("version of class '{}' is not a string", class))
            })?;
            versions.insert(class.clone(), text.parse()?);
        }
        Ok(versions)
    }

    /// Intersect our announcement with the peer's.
    ///
    /// A class survives when both sides list it with the same major version;
    /// the lower of the two versions is kept. Every class in `required` must
    /// survive, otherwise the peer is rejected.
    pub fn negotiate(&self, peer: &MessageClassVersions, required: &[String]) -> Result<Self> {
        let mut negotiated = Self::new();
        for (class, ours) in &self.versions {
            match peer.get(class) {
                Some(theirs) if ours.is_compatible_with(&theirs) => {
                    negotiated.insert(class.clone(), (*ours).min(theirs));
                }
                Some(theirs) => {
                    tracing::warn!(
                        "Message class '{}' version mismatch: host {}, worker {}",
                        class,
                        ours,
                        theirs
                    );
                }
                None => {}
            }
        }

        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|class| !negotiated.contains(class))
            .collect();
        if !missing.is_empty() {
            return Err(HostError::Protocol(format!(
                "worker lacks required message classes: {}",
                missing.join(", ")
            )));
        }

        Ok(negotiated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> MessageClassVersions {
        MessageClassVersions::new()
            .with("internal", ClassVersion::new(1, 2))
            .with("base", ClassVersion::new(1, 0))
            .with("media", ClassVersion::new(2, 0))
    }

    #[test]
    fn test_parse_version() {
        assert_eq!("1.3".parse::<ClassVersion>().unwrap(), ClassVersion::new(1, 3));
        assert_eq!("4".parse::<ClassVersion>().unwrap(), ClassVersion::new(4, 0));
        assert!("one.two".parse::<ClassVersion>().is_err());
    }

    #[test]
    fn test_negotiate_keeps_lower_compatible_version() {
        let worker = MessageClassVersions::new()
            .with("internal", ClassVersion::new(1, 0))
            .with("base", ClassVersion::new(1, 4))
            .with("media", ClassVersion::new(3, 0));

        let negotiated = host()
            .negotiate(&worker, &["internal".to_string()])
            .unwrap();
        assert_eq!(negotiated.get("internal"), Some(ClassVersion::new(1, 0)));
        assert_eq!(negotiated.get("base"), Some(ClassVersion::new(1, 0)));
        assert!(!negotiated.contains("media"));
    }

    #[test]
    fn test_negotiate_rejects_missing_required_class() {
        let worker = MessageClassVersions::new().with("internal", ClassVersion::new(1, 0));
        let err = host()
            .negotiate(&worker, &["internal".to_string(), "media".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("media"));
    }

    #[test]
    fn test_value_round_trip() {
        let versions = host();
        assert_eq!(
            MessageClassVersions::from_value(&versions.to_value()).unwrap(),
            versions
        );
        assert!(MessageClassVersions::from_value(&Value::Integer(1)).is_err());
    }
}
