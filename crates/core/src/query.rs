use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};
use crate::filter::TagFilter;
use crate::model::span::SpanStatusCode;
use crate::model::trace::{Trace, TraceSummary};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceQuery {
    pub trace_id: Option<String>,
    pub service: Option<String>,
    /// Substring match against any span's operation name.
    pub operation: Option<String>,
    /// All filters must hold on at least one span.
    pub tags: Vec<TagFilter>,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub has_errors: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TraceQuery {
    fn default() -> Self {
        Self {
            trace_id: None,
            service: None,
            operation: None,
            tags: Vec::new(),
            min_duration_ms: None,
            max_duration_ms: None,
            start_time: None,
            end_time: None,
            has_errors: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSearchResponse {
    pub traces: Vec<Trace>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub span_id: String,
    pub service_name: String,
    pub operation_name: String,
    pub relative_start_ms: i64,
    pub duration_ms: i64,
    pub level: usize,
    pub status: SpanStatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub weight: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl DependencyGraph {
    pub fn edge(&self, from: &str, to: &str) -> Option<&GraphEdge> {
        self.edges.iter().find(|e| e.from == from && e.to == to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceDependency {
    pub service: String,
    pub dependencies: Vec<String>,
    pub call_counts: BTreeMap<String, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceMetrics {
    pub service: String,
    pub average_duration_ms: f64,
    pub p50_duration_ms: i64,
    pub p90_duration_ms: i64,
    pub p95_duration_ms: i64,
    pub p99_duration_ms: i64,
    /// Errored spans over total spans of the service in the last completed trace.
    pub error_rate: f64,
    pub traces_observed: u64,
    pub slowest_traces: Vec<TraceSummary>,
    pub error_traces: Vec<TraceSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TraceStatistics {
    pub total_traces: usize,
    pub total_spans: usize,
    pub open_spans: usize,
    pub services: usize,
    pub average_trace_size: f64,
    pub average_trace_duration_ms: f64,
    pub error_rate: f64,
    pub sampling_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertStatistics {
    pub total: usize,
    pub active: usize,
    pub acknowledged: usize,
    pub resolved: usize,
    pub suppressed: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_service: BTreeMap<String, usize>,
    pub average_resolution_ms: f64,
    /// Placeholder until alert feedback is tracked.
    pub false_positive_rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Json,
    Jaeger,
    Zipkin,
}

impl FromStr for ExportFormat {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jaeger" => Ok(Self::Jaeger),
            "zipkin" => Ok(Self::Zipkin),
            _ => Err(VigilError::Parse(format!("unknown export format: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state_dir: String,
    pub traces: TraceStatistics,
    pub alerts: AlertStatistics,
    pub rules: usize,
    pub pending_timers: usize,
}
