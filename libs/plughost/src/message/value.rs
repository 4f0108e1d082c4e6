// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Typed parameter values carried by a [`Message`](super::Message).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One typed parameter value.
///
/// Serialized externally tagged (`{"integer": 5}`) so the type survives the
/// trip through a frame unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Blob(#[serde(with = "blob_base64")] Vec<u8>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Reals also accept integers, since a peer may send `2` for `2.0`.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(r) => Some(*r),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// True when every real number inside this value is finite.
    ///
    /// JSON has no spelling for NaN or infinity, so such values cannot be framed.
    pub(crate) fn is_frameable(&self) -> bool {
        match self {
            Self::Real(r) => r.is_finite(),
            Self::Map(m) => m.values().all(Value::is_frameable),
            _ => true,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

mod blob_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_accepts_integer() {
        assert_eq!(Value::Integer(3).as_real(), Some(3.0));
        assert_eq!(Value::String("3".into()).as_real(), None);
    }

    #[test]
    fn test_blob_is_base64_on_the_wire() {
        let json = serde_json::to_string(&Value::Blob(vec![0xAB, 0xCD])).unwrap();
        assert_eq!(json, r#"{"blob":"q80="}"#);
    }

    #[test]
    fn test_nested_non_finite_is_not_frameable() {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Real(f64::NAN));
        assert!(!Value::Map(inner).is_frameable());
        assert!(Value::Real(1.5).is_frameable());
    }
}
