use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::span::{Span, SpanStatusCode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    #[default]
    Success,
    Timeout,
    Error,
}

impl TraceStatus {
    /// Moves toward error as spans finish; never moves back.
    pub fn escalate(self, code: SpanStatusCode) -> Self {
        match (self, code) {
            (_, SpanStatusCode::Error) => Self::Error,
            (Self::Success, SpanStatusCode::Timeout) => Self::Timeout,
            (current, _) => current,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<Span>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub services: Vec<String>,
    pub operations_count: usize,
    pub error_count: usize,
    pub status: TraceStatus,
    pub root_span_id: Option<String>,
    pub complete: bool,
}

impl Trace {
    pub fn root_span(&self) -> Option<&Span> {
        let root = self.root_span_id.as_deref()?;
        self.spans.iter().find(|s| s.span_id == root)
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.trace_id.clone(),
            root_operation: self.root_span().map(|s| s.operation_name.clone()),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration_ms,
            span_count: self.operations_count,
            error_count: self.error_count,
            status: self.status,
            services: self.services.clone(),
        }
    }
}

/// Compact view of a trace used by rankings and events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceSummary {
    pub trace_id: String,
    pub root_operation: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub span_count: usize,
    pub error_count: usize,
    pub status: TraceStatus,
    pub services: Vec<String>,
}
