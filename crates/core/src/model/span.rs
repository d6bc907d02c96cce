use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl TagValue {
    /// Type label used by the Jaeger export.
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int64",
            Self::Float(_) => "float64",
            Self::Str(_) => "string",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::from(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Str(v) => serde_json::Value::from(v.as_str()),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

pub type Tags = BTreeMap<String, TagValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    pub fields: Tags,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatusCode {
    #[default]
    Ok,
    Error,
    Timeout,
    Cancelled,
}

impl SpanStatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SpanStatus {
    pub code: SpanStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    ChildOf,
    FollowsFrom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanReference {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub trace_id: String,
    pub span_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub service_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub tags: Tags,
    pub logs: Vec<SpanLog>,
    pub status: SpanStatus,
    pub references: Vec<SpanReference>,
}

impl Span {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.status.code == SpanStatusCode::Error
    }

    pub fn duration_or_zero(&self) -> i64 {
        self.duration_ms.unwrap_or(0)
    }

    /// Span id of the first `child_of` reference, falling back to the explicit parent.
    pub fn parent_reference(&self) -> Option<&str> {
        self.references
            .iter()
            .find(|r| r.kind == ReferenceKind::ChildOf)
            .map(|r| r.span_id.as_str())
            .or(self.parent_span_id.as_deref())
    }
}
