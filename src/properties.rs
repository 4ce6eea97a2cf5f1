//! Dynamically typed build properties.
//!
//! Build masters attach arbitrary JSON values to builds. Revision tracking
//! and message templating need to compare and render those values, so they
//! are modeled as a small tagged variant rather than raw `serde_json::Value`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A build property value as delivered by a master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PropValue {
    /// Convert from an arbitrary JSON value. Composite values (arrays,
    /// objects) degrade to their JSON string form.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropValue::Null,
            serde_json::Value::Bool(b) => PropValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PropValue::Int(i)
                } else {
                    PropValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => PropValue::Str(s.clone()),
            other => PropValue::Str(other.to_string()),
        }
    }

    /// Numeric view, when the value is a number.
    fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Int(i) => Some(*i as f64),
            PropValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Compare two property values for revision ordering: numeric when both
    /// sides are numeric, lexicographic on the rendered strings otherwise.
    pub fn compare(&self, other: &PropValue) -> Ordering {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => write!(f, "None"),
            PropValue::Bool(b) => write!(f, "{}", b),
            PropValue::Int(i) => write!(f, "{}", i),
            PropValue::Float(v) => write!(f, "{}", v),
            PropValue::Str(s) => write!(f, "{}", s),
        }
    }
}

fn commit_position_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.*@\{#(\d+)\}$").unwrap())
}

/// Normalize git commit-position footers to plain integers.
///
/// Values of the form `refs/heads/main@{#12345}` become `Int(12345)` so that
/// revision comparisons are numeric. Anything else passes through untouched.
pub fn normalize_commit_position(value: PropValue) -> PropValue {
    if let PropValue::Str(ref s) = value {
        if let Some(caps) = commit_position_re().captures(s) {
            if let Ok(n) = caps[1].parse::<i64>() {
                return PropValue::Int(n);
            }
        }
    }
    value
}
