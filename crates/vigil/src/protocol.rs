use serde::{Deserialize, Serialize};
use vigil_alerts::RuleEvaluation;
use vigil_core::model::alert::Alert;
use vigil_core::model::rule::AlertRule;
use vigil_core::model::span::{Span, SpanStatusCode, Tags};
use vigil_core::model::trace::Trace;
use vigil_core::provider::ServiceHealth;
use vigil_core::query::{
    AlertStatistics, DependencyGraph, ExportFormat, ServiceMetrics, StatusResponse,
    TimelineEntry, TraceQuery, TraceSearchResponse,
};
use vigil_store::StartSpan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanTagsRequest {
    pub span_id: String,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub span_id: String,
    pub code: SpanStatusCode,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricReport {
    pub metric: String,
    #[serde(default)]
    pub service: Option<String>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReport {
    #[serde(default)]
    pub service: Option<String>,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub query: TraceQuery,
    pub format: ExportFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLifecycleRequest {
    pub alert_id: String,
    #[serde(default)]
    pub by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressRequest {
    pub alert_id: String,
    pub minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleToggleRequest {
    pub rule_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingUpdate {
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub adaptive: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleDecision {
    pub sample: bool,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    StartSpan(StartSpan),
    FinishSpan(SpanTagsRequest),
    AddTags(SpanTagsRequest),
    SetStatus(SetStatusRequest),
    AddLog(SpanTagsRequest),
    ShouldSample,
    SetSampling(SamplingUpdate),
    Metric(MetricReport),
    Log(LogReport),
    Health(ServiceHealth),
    Trace(String),
    Traces(TraceQuery),
    Timeline(String),
    Graph,
    Services,
    Export(ExportRequest),
    Evaluate,
    Alerts,
    Alert(String),
    Acknowledge(AlertLifecycleRequest),
    Resolve(AlertLifecycleRequest),
    Suppress(SuppressRequest),
    Rules,
    SetRuleEnabled(RuleToggleRequest),
    AlertStats,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiResponse {
    Span(Span),
    /// Whether a write or lifecycle request changed anything.
    Applied(bool),
    Sample(SampleDecision),
    Trace(Trace),
    Traces(TraceSearchResponse),
    Timeline(Vec<TimelineEntry>),
    Graph(DependencyGraph),
    Services(Vec<ServiceMetrics>),
    Export(serde_json::Value),
    Evaluations(Vec<RuleEvaluation>),
    Alerts(Vec<Alert>),
    Alert(Alert),
    Rules(Vec<AlertRule>),
    AlertStats(AlertStatistics),
    Status(StatusResponse),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_external_tags() {
        let raw = r#"{"Metric":{"metric":"system.cpu.usage","value":91.5}}"#;
        let req: ApiRequest = serde_json::from_str(raw).unwrap();
        assert!(matches!(req, ApiRequest::Metric(ref m) if m.service.is_none() && m.value == 91.5));

        let status: ApiRequest = serde_json::from_str(r#""Status""#).unwrap();
        assert!(matches!(status, ApiRequest::Status));

        let encoded = serde_json::to_value(ApiResponse::Applied(true)).unwrap();
        assert_eq!(encoded, serde_json::json!({"Applied": true}));
    }

    #[test]
    fn start_span_accepts_minimal_body() {
        let raw = r#"{"StartSpan":{"operation":"GET /users","service":"api"}}"#;
        let req: ApiRequest = serde_json::from_str(raw).unwrap();
        let ApiRequest::StartSpan(start) = req else {
            panic!("expected StartSpan");
        };
        assert_eq!(start.service, "api");
        assert!(start.parent.is_none());
        assert!(start.tags.is_empty());
    }
}
