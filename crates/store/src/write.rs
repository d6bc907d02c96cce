use serde::{Deserialize, Serialize};
use vigil_core::event::TraceEvent;
use vigil_core::ids::{mint_span_id, mint_trace_id};
use vigil_core::model::span::{
    ReferenceKind, Span, SpanLog, SpanReference, SpanStatus, SpanStatusCode, TagValue, Tags,
};

use crate::TraceStore;
use crate::assemble;

/// Where a new span attaches: under a known span, or directly into an existing trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentRef {
    Span { trace_id: String, span_id: String },
    Trace(String),
}

impl From<&Span> for ParentRef {
    fn from(span: &Span) -> Self {
        Self::Span {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartSpan {
    pub operation: String,
    pub service: String,
    #[serde(default)]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub tags: Tags,
}

impl StartSpan {
    pub fn new(operation: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn child_of(mut self, parent: &Span) -> Self {
        self.parent = Some(ParentRef::from(parent));
        self
    }

    pub fn in_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.parent = Some(ParentRef::Trace(trace_id.into()));
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

impl TraceStore {
    pub fn start_span(&self, req: StartSpan) -> Span {
        let (trace_id, parent_span_id) = match req.parent {
            Some(ParentRef::Span { trace_id, span_id }) => (trace_id, Some(span_id)),
            Some(ParentRef::Trace(trace_id)) => (trace_id, None),
            None => (mint_trace_id(), None),
        };

        let references = parent_span_id
            .iter()
            .map(|parent| SpanReference {
                kind: ReferenceKind::ChildOf,
                trace_id: trace_id.clone(),
                span_id: parent.clone(),
            })
            .collect();

        let span = Span {
            trace_id,
            span_id: mint_span_id(),
            parent_span_id,
            operation_name: req.operation,
            service_name: req.service,
            start_time: self.now(),
            end_time: None,
            duration_ms: None,
            tags: req.tags,
            logs: Vec::new(),
            status: SpanStatus::default(),
            references,
        };

        {
            let mut state = self.state();
            let caller = span
                .parent_reference()
                .and_then(|id| state.spans.get(id))
                .map(|parent| parent.service_name.clone())
                .filter(|caller| *caller != span.service_name);
            if let Some(caller) = caller {
                state.callers.insert(span.span_id.clone(), caller);
            }
            *state.open_by_trace.entry(span.trace_id.clone()).or_insert(0) += 1;
            if let Some(entry) = state.traces.get_mut(&span.trace_id) {
                entry.complete = false;
            }
            state.spans.insert(span.span_id.clone(), span.clone());
        }

        tracing::debug!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            operation = %span.operation_name,
            service = %span.service_name,
            "span started"
        );
        self.publish(TraceEvent::SpanStarted(span.clone()));
        span
    }

    /// Closes an open span. Returns `false` for unknown or already finished spans.
    pub fn finish_span(&self, span_id: &str, tags: Tags) -> bool {
        let now = self.now();
        let (finished, completed) = {
            let mut state = self.state();
            let Some(span) = state.spans.get_mut(span_id) else {
                tracing::warn!(span_id, "finish for unknown span");
                return false;
            };
            if span.end_time.is_some() {
                tracing::warn!(span_id, "span already finished");
                return false;
            }

            span.end_time = Some(now);
            span.duration_ms = Some((now - span.start_time).num_milliseconds());
            span.tags.extend(tags);
            let finished = span.clone();

            let completed =
                assemble::on_span_finished(&mut state, &finished, self.config().max_spans_per_trace);
            (finished, completed)
        };

        tracing::debug!(
            trace_id = %finished.trace_id,
            span_id = %finished.span_id,
            duration_ms = finished.duration_or_zero(),
            "span finished"
        );
        self.publish(TraceEvent::SpanFinished(finished));

        if let Some(summary) = completed {
            tracing::debug!(
                trace_id = %summary.trace_id,
                spans = summary.span_count,
                duration_ms = summary.duration_ms,
                "trace completed"
            );
            self.publish(TraceEvent::TraceCompleted(summary));
        }
        true
    }

    pub fn add_log(&self, span_id: &str, fields: Tags) -> bool {
        let timestamp = self.now();
        let mut state = self.state();
        let Some(span) = state.spans.get_mut(span_id) else {
            tracing::warn!(span_id, "log for unknown span");
            return false;
        };
        span.logs.push(SpanLog { timestamp, fields });
        true
    }

    pub fn set_status(&self, span_id: &str, code: SpanStatusCode, message: Option<String>) -> bool {
        let mut state = self.state();
        let Some(span) = state.spans.get_mut(span_id) else {
            tracing::warn!(span_id, status = code.as_str(), "status for unknown span");
            return false;
        };
        span.status = SpanStatus { code, message };
        if code == SpanStatusCode::Error {
            span.tags.insert("error".to_string(), TagValue::Bool(true));
        }
        true
    }

    pub fn add_tags(&self, span_id: &str, tags: Tags) -> bool {
        let mut state = self.state();
        let Some(span) = state.spans.get_mut(span_id) else {
            tracing::warn!(span_id, "tags for unknown span");
            return false;
        };
        span.tags.extend(tags);
        true
    }
}

#[cfg(test)]
mod tests {
    use testkit::ManualClock;
    use vigil_core::event::TraceEvent;
    use vigil_core::ids::is_hex_id;
    use vigil_core::model::span::{ReferenceKind, SpanStatusCode, TagValue, Tags};

    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    fn store() -> (TraceStore, ManualClock) {
        let clock = ManualClock::at_base();
        let store = TraceStore::with_clock(TraceStoreConfig::default(), clock.shared());
        (store, clock)
    }

    #[test]
    fn start_span_mints_ids_and_links_parent() {
        let (store, _clock) = store();
        let root = store.start_span(StartSpan::new("GET /orders", "api"));
        assert!(is_hex_id(&root.trace_id, 32));
        assert!(is_hex_id(&root.span_id, 16));
        assert!(root.references.is_empty());
        assert!(root.is_open());

        let child = store.start_span(StartSpan::new("SELECT", "db").child_of(&root));
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_eq!(child.references.len(), 1);
        assert_eq!(child.references[0].kind, ReferenceKind::ChildOf);

        let joined = store.start_span(StartSpan::new("async job", "worker").in_trace(&root.trace_id));
        assert_eq!(joined.trace_id, root.trace_id);
        assert!(joined.parent_span_id.is_none());
        assert!(joined.references.is_empty());
    }

    #[test]
    fn finish_sets_duration_once() {
        let (store, clock) = store();
        let span = store.start_span(StartSpan::new("work", "api"));
        clock.advance_ms(120);

        let mut tags = Tags::new();
        tags.insert("rows".into(), TagValue::Int(3));
        assert!(store.finish_span(&span.span_id, tags));

        clock.advance_ms(500);
        assert!(!store.finish_span(&span.span_id, Tags::new()));

        let stored = store.get_span(&span.span_id).unwrap();
        assert_eq!(stored.duration_ms, Some(120));
        assert_eq!(
            stored.end_time.unwrap() - stored.start_time,
            chrono::Duration::milliseconds(120)
        );
        assert_eq!(stored.tags["rows"], TagValue::Int(3));
    }

    #[test]
    fn unknown_span_operations_return_false() {
        let (store, _clock) = store();
        assert!(!store.finish_span("missing", Tags::new()));
        assert!(!store.add_log("missing", Tags::new()));
        assert!(!store.add_tags("missing", Tags::new()));
        assert!(!store.set_status("missing", SpanStatusCode::Error, None));
    }

    #[test]
    fn error_status_tags_span() {
        let (store, _clock) = store();
        let span = store.start_span(StartSpan::new("work", "api"));
        assert!(store.set_status(&span.span_id, SpanStatusCode::Error, Some("boom".into())));

        let mut fields = Tags::new();
        fields.insert("event".into(), TagValue::from("retry"));
        assert!(store.add_log(&span.span_id, fields));

        let stored = store.get_span(&span.span_id).unwrap();
        assert!(stored.is_error());
        assert_eq!(stored.status.message.as_deref(), Some("boom"));
        assert_eq!(stored.tags["error"], TagValue::Bool(true));
        assert_eq!(stored.logs.len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let (store, clock) = store();
        let mut rx = store.subscribe();

        let span = store.start_span(StartSpan::new("work", "api"));
        clock.advance_ms(10);
        store.finish_span(&span.span_id, Tags::new());

        assert!(matches!(rx.recv().await.unwrap(), TraceEvent::SpanStarted(s) if s.span_id == span.span_id));
        assert!(matches!(rx.recv().await.unwrap(), TraceEvent::SpanFinished(s) if s.duration_ms == Some(10)));
        match rx.recv().await.unwrap() {
            TraceEvent::TraceCompleted(summary) => {
                assert_eq!(summary.trace_id, span.trace_id);
                assert_eq!(summary.span_count, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
