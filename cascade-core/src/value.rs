//! Node values.
//!
//! Nodes of different kinds feed each other (raw bytes into a text decoder,
//! decoded JSON into a replacer), so a node's value is dynamically typed.

use std::fmt;

use serde::Serialize;

/// The value cached by a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the value as text, if it is text or a JSON string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Borrow the raw bytes of a bytes or text value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Render the value as the bytes a file sink would write.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Bytes(b) => b.clone(),
            other => other.to_string().into_bytes(),
        }
    }

    /// Short human summary used by the console sink.
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bytes(b) => format!("{} bytes", b.len()),
            Value::Text(s) => format!("{} chars", s.chars().count()),
            Value::Json(serde_json::Value::Array(items)) => format!("{} items", items.len()),
            Value::Json(serde_json::Value::Object(map)) => format!("{} keys", map.len()),
            Value::Json(serde_json::Value::String(s)) => format!("{} chars", s.chars().count()),
            Value::Json(scalar) => scalar.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Text(s) => f.write_str(s),
            Value::Json(serde_json::Value::String(s)) => f.write_str(s),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Json(n.into())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}
