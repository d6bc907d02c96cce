use vigil_core::model::span::Span;
use vigil_core::model::trace::TraceSummary;

use crate::db::{State, TraceEntry};

/// Folds a just-finished span into its trace. Returns the trace summary when
/// this finish closed the last open span of the trace.
pub(crate) fn on_span_finished(
    state: &mut State,
    span: &Span,
    max_spans_per_trace: usize,
) -> Option<TraceSummary> {
    let State {
        spans,
        open_by_trace,
        callers,
        traces,
        analyzer,
        graph,
        ..
    } = state;

    let end = span.end_time.unwrap_or(span.start_time);
    let entry = traces
        .entry(span.trace_id.clone())
        .or_insert_with(|| TraceEntry::new(&span.trace_id, span.start_time));

    if entry.span_ids.is_empty() {
        entry.start_time = span.start_time;
        entry.end_time = end;
    } else {
        entry.start_time = entry.start_time.min(span.start_time);
        entry.end_time = entry.end_time.max(end);
    }
    if !entry.services.contains(&span.service_name) {
        entry.services.push(span.service_name.clone());
    }
    entry.span_ids.push(span.span_id.clone());
    if span.is_error() {
        entry.error_count += 1;
    }
    entry.status = entry.status.escalate(span.status.code);

    if let Some(caller) = callers.remove(&span.span_id) {
        graph.record(&caller, &span.service_name, span.is_error());
    }

    if entry.span_ids.len() > max_spans_per_trace {
        let excess = entry.span_ids.len() - max_spans_per_trace;
        for trimmed in entry.span_ids.drain(..excess) {
            spans.remove(&trimmed);
        }
    }

    entry.root_span_id = entry
        .span_ids
        .iter()
        .find(|id| {
            spans
                .get(id.as_str())
                .is_some_and(|s| s.parent_reference().is_none())
        })
        .or_else(|| entry.span_ids.first())
        .cloned();

    let still_open = match open_by_trace.get_mut(&span.trace_id) {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => 0,
    };
    if still_open > 0 {
        return None;
    }

    open_by_trace.remove(&span.trace_id);
    entry.complete = true;
    let trace = entry.materialize(spans);
    analyzer.record(&trace);
    Some(trace.summary())
}

#[cfg(test)]
mod tests {
    use testkit::ManualClock;
    use vigil_core::model::span::{SpanStatusCode, Tags};
    use vigil_core::model::trace::TraceStatus;

    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    fn store_with(config: TraceStoreConfig) -> (TraceStore, ManualClock) {
        let clock = ManualClock::at_base();
        (TraceStore::with_clock(config, clock.shared()), clock)
    }

    #[test]
    fn trace_completes_only_when_last_span_finishes() {
        let (store, clock) = store_with(TraceStoreConfig::default());
        let root = store.start_span(StartSpan::new("GET /orders", "api"));
        clock.advance_ms(10);
        let child = store.start_span(StartSpan::new("SELECT orders", "db").child_of(&root));
        clock.advance_ms(40);

        store.finish_span(&child.span_id, Tags::new());
        let trace = store.get_trace(&root.trace_id).unwrap();
        assert!(!trace.complete);
        assert_eq!(trace.operations_count, 1);

        clock.advance_ms(50);
        store.finish_span(&root.span_id, Tags::new());
        let trace = store.get_trace(&root.trace_id).unwrap();
        assert!(trace.complete);
        assert_eq!(trace.duration_ms, 100);
        assert_eq!(trace.operations_count, 2);
        assert_eq!(trace.services, vec!["db".to_string(), "api".to_string()]);
        assert_eq!(trace.root_span_id.as_deref(), Some(root.span_id.as_str()));
    }

    #[test]
    fn status_escalates_and_never_reverts() {
        let (store, clock) = store_with(TraceStoreConfig::default());
        let root = store.start_span(StartSpan::new("root", "api"));
        let slow = store.start_span(StartSpan::new("slow", "api").child_of(&root));
        let bad = store.start_span(StartSpan::new("bad", "api").child_of(&root));
        clock.advance_ms(5);

        store.set_status(&slow.span_id, SpanStatusCode::Timeout, None);
        store.finish_span(&slow.span_id, Tags::new());
        assert_eq!(store.get_trace(&root.trace_id).unwrap().status, TraceStatus::Timeout);

        store.set_status(&bad.span_id, SpanStatusCode::Error, None);
        store.finish_span(&bad.span_id, Tags::new());
        store.finish_span(&root.span_id, Tags::new());

        let trace = store.get_trace(&root.trace_id).unwrap();
        assert_eq!(trace.status, TraceStatus::Error);
        assert_eq!(trace.error_count, 1);
    }

    #[test]
    fn span_cap_keeps_newest_and_drops_trimmed_spans() {
        let config = TraceStoreConfig {
            max_spans_per_trace: 2,
            ..TraceStoreConfig::default()
        };
        let (store, clock) = store_with(config);
        let root = store.start_span(StartSpan::new("root", "api"));
        let mut children = Vec::new();
        for i in 0..3 {
            children.push(store.start_span(StartSpan::new(format!("step {i}"), "api").child_of(&root)));
        }
        clock.advance_ms(1);
        store.set_status(&children[0].span_id, SpanStatusCode::Error, None);
        for child in &children {
            store.finish_span(&child.span_id, Tags::new());
        }

        let trace = store.get_trace(&root.trace_id).unwrap();
        assert_eq!(trace.operations_count, 2);
        assert_eq!(trace.spans[0].span_id, children[1].span_id);
        assert_eq!(trace.spans[1].span_id, children[2].span_id);
        assert_eq!(trace.error_count, 1);
        assert!(store.get_span(&children[0].span_id).is_none());
    }

    #[test]
    fn trimmed_parent_still_yields_dependency_edge() {
        let config = TraceStoreConfig {
            max_spans_per_trace: 1,
            ..TraceStoreConfig::default()
        };
        let (store, clock) = store_with(config);
        let root = store.start_span(StartSpan::new("GET /checkout", "api"));
        let call = store.start_span(StartSpan::new("charge", "payments").child_of(&root));
        clock.advance_ms(5);

        store.finish_span(&root.span_id, Tags::new());
        let late = store.start_span(StartSpan::new("audit", "ledger").child_of(&root));
        store.finish_span(&call.span_id, Tags::new());
        assert!(store.get_span(&root.span_id).is_none());
        store.finish_span(&late.span_id, Tags::new());

        let graph = store.dependency_graph();
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edge("api", "payments").map(|e| e.weight), Some(1));
        assert_eq!(graph.edge("api", "ledger").map(|e| e.weight), Some(1));
    }

    #[test]
    fn joining_a_completed_trace_reopens_it() {
        let (store, clock) = store_with(TraceStoreConfig::default());
        let root = store.start_span(StartSpan::new("root", "api"));
        clock.advance_ms(5);
        store.finish_span(&root.span_id, Tags::new());
        assert!(store.get_trace(&root.trace_id).unwrap().complete);

        let late = store.start_span(StartSpan::new("callback", "api").in_trace(&root.trace_id));
        assert!(!store.get_trace(&root.trace_id).unwrap().complete);

        clock.advance_ms(5);
        store.finish_span(&late.span_id, Tags::new());
        let trace = store.get_trace(&root.trace_id).unwrap();
        assert!(trace.complete);
        assert_eq!(trace.root_span_id.as_deref(), Some(root.span_id.as_str()));
    }
}
