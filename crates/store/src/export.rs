use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use vigil_core::model::span::{Span, SpanLog};
use vigil_core::model::trace::Trace;
use vigil_core::query::{ExportFormat, TraceQuery};

use crate::TraceStore;

impl TraceStore {
    pub fn export_traces(&self, query: &TraceQuery, format: ExportFormat) -> Value {
        let traces = self.search_traces(query).traces;
        match format {
            ExportFormat::Json => serde_json::to_value(&traces).unwrap_or_default(),
            ExportFormat::Jaeger => to_jaeger(&traces),
            ExportFormat::Zipkin => to_zipkin(&traces),
        }
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis() * 1000
}

pub fn to_jaeger(traces: &[Trace]) -> Value {
    let data: Vec<Value> = traces
        .iter()
        .map(|trace| {
            json!({
                "traceID": trace.trace_id,
                "spans": trace.spans.iter().map(jaeger_span).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "data": data })
}

fn jaeger_span(span: &Span) -> Value {
    let tags: Vec<Value> = span
        .tags
        .iter()
        .map(|(key, value)| {
            json!({
                "key": key,
                "type": value.type_label(),
                "value": value.to_json(),
            })
        })
        .collect();

    let logs: Vec<Value> = span
        .logs
        .iter()
        .map(|log| {
            json!({
                "timestamp": micros(log.timestamp),
                "fields": log
                    .fields
                    .iter()
                    .map(|(key, value)| json!({ "key": key, "value": value.to_string() }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "traceID": span.trace_id,
        "spanID": span.span_id,
        "parentSpanID": span.parent_span_id.clone().unwrap_or_default(),
        "operationName": span.operation_name,
        "process": {
            "serviceName": span.service_name,
            "tags": [],
        },
        "startTime": micros(span.start_time),
        "duration": span.duration_or_zero() * 1000,
        "tags": tags,
        "logs": logs,
    })
}

pub fn to_zipkin(traces: &[Trace]) -> Value {
    let spans: Vec<Value> = traces
        .iter()
        .flat_map(|trace| trace.spans.iter())
        .map(zipkin_span)
        .collect();
    Value::Array(spans)
}

fn zipkin_span(span: &Span) -> Value {
    let mut out = Map::new();
    out.insert("traceId".into(), json!(span.trace_id));
    out.insert("id".into(), json!(span.span_id));
    if let Some(parent) = &span.parent_span_id {
        out.insert("parentId".into(), json!(parent));
    }
    out.insert("name".into(), json!(span.operation_name));
    out.insert(
        "localEndpoint".into(),
        json!({ "serviceName": span.service_name }),
    );
    out.insert("timestamp".into(), json!(micros(span.start_time)));
    out.insert("duration".into(), json!(span.duration_or_zero() * 1000));

    let tags: Map<String, Value> = span
        .tags
        .iter()
        .map(|(key, value)| (key.clone(), Value::String(value.to_string())))
        .collect();
    out.insert("tags".into(), Value::Object(tags));
    out.insert(
        "annotations".into(),
        Value::Array(span.logs.iter().map(zipkin_annotation).collect()),
    );
    Value::Object(out)
}

fn zipkin_annotation(log: &SpanLog) -> Value {
    let fields: Map<String, Value> = log
        .fields
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect();
    json!({
        "timestamp": micros(log.timestamp),
        "value": Value::Object(fields).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use testkit::ManualClock;
    use vigil_core::model::span::{TagValue, Tags};
    use vigil_core::query::{ExportFormat, TraceQuery};

    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    fn two_span_trace() -> (TraceStore, String) {
        let clock = ManualClock::at_base();
        let store = TraceStore::with_clock(TraceStoreConfig::default(), clock.shared());
        let root = store.start_span(StartSpan::new("GET /orders", "api").tag("http.status", 200i64));
        clock.advance_ms(5);
        let child = store.start_span(StartSpan::new("SELECT", "db").child_of(&root));
        let mut fields = Tags::new();
        fields.insert("rows".into(), TagValue::Int(12));
        store.add_log(&child.span_id, fields);
        clock.advance_ms(20);
        store.finish_span(&child.span_id, Tags::new());
        store.finish_span(&root.span_id, Tags::new());
        (store, root.trace_id)
    }

    #[test]
    fn jaeger_export_uses_microseconds() {
        let (store, trace_id) = two_span_trace();
        let trace = store.get_trace(&trace_id).unwrap();
        let out = store.export_traces(&TraceQuery::default(), ExportFormat::Jaeger);

        let spans = out["data"][0]["spans"].as_array().unwrap();
        assert_eq!(out["data"][0]["traceID"], trace_id);
        assert_eq!(spans.len(), 2);
        for (exported, span) in spans.iter().zip(&trace.spans) {
            let start_us = exported["startTime"].as_i64().unwrap();
            assert_eq!(start_us / 1000, span.start_time.timestamp_millis());
            assert_eq!(exported["duration"].as_i64().unwrap(), span.duration_ms.unwrap() * 1000);
            assert_eq!(exported["process"]["serviceName"], span.service_name.as_str());
        }

        let child = &spans[0];
        assert_eq!(child["parentSpanID"], spans[1]["spanID"]);
        assert_eq!(child["logs"][0]["fields"][0]["key"], "rows");
        assert_eq!(child["logs"][0]["fields"][0]["value"], "12");
        assert_eq!(spans[1]["parentSpanID"], "");
        assert_eq!(spans[1]["tags"][0]["type"], "int64");
        assert_eq!(spans[1]["tags"][0]["value"], 200);
    }

    #[test]
    fn zipkin_export_is_flat() {
        let (store, trace_id) = two_span_trace();
        let out = store.export_traces(&TraceQuery::default(), ExportFormat::Zipkin);
        let spans = out.as_array().unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans.iter().all(|s| s["traceId"] == trace_id.as_str()));
        assert!(spans[1].get("parentId").is_none());
        assert_eq!(spans[0]["localEndpoint"]["serviceName"], "db");
        assert_eq!(spans[0]["duration"], 20_000);
        assert_eq!(spans[0]["annotations"][0]["value"], "{\"rows\":12}");
        assert_eq!(spans[1]["tags"]["http.status"], "200");
    }

    #[test]
    fn json_export_round_trips_traces() {
        let (store, trace_id) = two_span_trace();
        let out = store.export_traces(&TraceQuery::default(), ExportFormat::Json);
        let traces: Vec<vigil_core::model::trace::Trace> = serde_json::from_value(out).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trace_id, trace_id);
    }
}
