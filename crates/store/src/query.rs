use std::collections::{HashMap, HashSet};

use vigil_core::model::span::Span;
use vigil_core::model::trace::Trace;
use vigil_core::query::{TimelineEntry, TraceQuery, TraceSearchResponse, TraceStatistics};

use crate::TraceStore;
use crate::db::TraceEntry;

const DEFAULT_LIMIT: usize = 100;

impl TraceStore {
    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let state = self.state();
        state
            .traces
            .get(trace_id)
            .map(|entry| entry.materialize(&state.spans))
    }

    pub fn get_span(&self, span_id: &str) -> Option<Span> {
        self.state().spans.get(span_id).cloned()
    }

    /// Matching traces, newest start first, paged by `offset`/`limit`.
    pub fn search_traces(&self, query: &TraceQuery) -> TraceSearchResponse {
        let state = self.state();
        let mut matched: Vec<&TraceEntry> = state
            .traces
            .values()
            .filter(|entry| matches_query(entry, &state.spans, query))
            .collect();
        matched.sort_by(|a, b| {
            b.start_time
                .cmp(&a.start_time)
                .then_with(|| a.trace_id.cmp(&b.trace_id))
        });

        let limit = if query.limit == 0 {
            DEFAULT_LIMIT
        } else {
            query.limit
        };
        TraceSearchResponse {
            total: matched.len(),
            traces: matched
                .into_iter()
                .skip(query.offset)
                .take(limit)
                .map(|entry| entry.materialize(&state.spans))
                .collect(),
        }
    }

    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        self.search_traces(&TraceQuery {
            limit,
            ..TraceQuery::default()
        })
        .traces
    }

    /// Depth-first span layout; spans whose parent is absent from the trace become roots.
    pub fn trace_timeline(&self, trace_id: &str) -> Option<Vec<TimelineEntry>> {
        let trace = self.get_trace(trace_id)?;
        let ids: HashSet<&str> = trace.spans.iter().map(|s| s.span_id.as_str()).collect();

        let mut children: HashMap<&str, Vec<&Span>> = HashMap::new();
        let mut roots = Vec::new();
        for span in &trace.spans {
            match span.parent_reference().filter(|p| ids.contains(p)) {
                Some(parent) => children.entry(parent).or_default().push(span),
                None => roots.push(span),
            }
        }

        let mut out = Vec::with_capacity(trace.spans.len());
        let mut stack: Vec<(&Span, usize)> = Vec::new();
        roots.sort_by_key(|s| s.start_time);
        stack.extend(roots.into_iter().rev().map(|s| (s, 0)));

        while let Some((span, level)) = stack.pop() {
            out.push(TimelineEntry {
                span_id: span.span_id.clone(),
                service_name: span.service_name.clone(),
                operation_name: span.operation_name.clone(),
                relative_start_ms: (span.start_time - trace.start_time).num_milliseconds(),
                duration_ms: span.duration_or_zero(),
                level,
                status: span.status.code,
            });

            if let Some(kids) = children.get_mut(span.span_id.as_str()) {
                kids.sort_by_key(|s| s.start_time);
                stack.extend(kids.iter().rev().map(|s| (*s, level + 1)));
            }
        }

        Some(out)
    }

    pub fn statistics(&self) -> TraceStatistics {
        let state = self.state();
        let mut services = HashSet::new();
        let mut span_total = 0usize;
        let mut error_total = 0usize;
        let mut duration_total = 0i64;

        for entry in state.traces.values() {
            services.extend(entry.services.iter().map(String::as_str));
            span_total += entry.span_ids.len();
            error_total += entry.error_count;
            duration_total += entry.duration_ms();
        }

        let trace_count = state.traces.len();
        let per_trace = |v: f64| {
            if trace_count == 0 {
                0.0
            } else {
                v / trace_count as f64
            }
        };

        TraceStatistics {
            total_traces: trace_count,
            total_spans: state.spans.len(),
            open_spans: state.open_spans(),
            services: services.len(),
            average_trace_size: per_trace(span_total as f64),
            average_trace_duration_ms: per_trace(duration_total as f64),
            error_rate: if span_total == 0 {
                0.0
            } else {
                error_total as f64 / span_total as f64
            },
            sampling_rate: state.sampler.rate(),
        }
    }
}

fn matches_query(entry: &TraceEntry, spans: &HashMap<String, Span>, query: &TraceQuery) -> bool {
    if let Some(id) = &query.trace_id
        && &entry.trace_id != id
    {
        return false;
    }
    if let Some(service) = &query.service
        && !entry.services.contains(service)
    {
        return false;
    }
    let duration = entry.duration_ms();
    if query.min_duration_ms.is_some_and(|min| duration < min) {
        return false;
    }
    if query.max_duration_ms.is_some_and(|max| duration > max) {
        return false;
    }
    if query.start_time.is_some_and(|start| entry.start_time < start) {
        return false;
    }
    if query.end_time.is_some_and(|end| entry.end_time > end) {
        return false;
    }
    if let Some(has_errors) = query.has_errors
        && (entry.error_count > 0) != has_errors
    {
        return false;
    }
    if let Some(op) = &query.operation
        && !entry.spans(spans).any(|s| s.operation_name.contains(op.as_str()))
    {
        return false;
    }
    if !query.tags.is_empty()
        && !entry
            .spans(spans)
            .any(|s| query.tags.iter().all(|f| f.matches_tags(&s.tags)))
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use testkit::ManualClock;
    use vigil_core::filter::TagFilter;
    use vigil_core::model::span::{SpanStatusCode, Tags};
    use vigil_core::query::TraceQuery;

    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    fn store() -> (TraceStore, ManualClock) {
        let clock = ManualClock::at_base();
        (
            TraceStore::with_clock(TraceStoreConfig::default(), clock.shared()),
            clock,
        )
    }

    #[test]
    fn api_to_db_timeline_and_graph() {
        let (store, clock) = store();
        let root = store.start_span(StartSpan::new("GET /orders", "api"));
        clock.advance_ms(10);
        let db = store.start_span(StartSpan::new("SELECT orders", "db").child_of(&root));
        clock.advance_ms(30);
        store.finish_span(&db.span_id, Tags::new());
        clock.advance_ms(10);
        store.finish_span(&root.span_id, Tags::new());

        let timeline = store.trace_timeline(&root.trace_id).unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].span_id, root.span_id);
        assert_eq!(timeline[0].level, 0);
        assert_eq!(timeline[0].relative_start_ms, 0);
        assert_eq!(timeline[0].duration_ms, 50);
        assert_eq!(timeline[1].span_id, db.span_id);
        assert_eq!(timeline[1].level, 1);
        assert_eq!(timeline[1].relative_start_ms, 10);
        assert_eq!(timeline[1].duration_ms, 30);

        let edge = store.dependency_graph().edge("api", "db").cloned().unwrap();
        assert_eq!(edge.weight, 1);
        assert_eq!(edge.errors, 0);
    }

    #[test]
    fn timeline_orders_siblings_and_promotes_orphans() {
        let (store, clock) = store();
        let root = store.start_span(StartSpan::new("root", "api"));
        clock.advance_ms(5);
        let late = store.start_span(StartSpan::new("late", "api").child_of(&root));
        let orphan = store.start_span(StartSpan::new("orphan", "api").in_trace(&root.trace_id));
        clock.advance_ms(5);
        let grandchild = store.start_span(StartSpan::new("leaf", "db").child_of(&late));
        clock.advance_ms(5);
        for span in [&grandchild, &late, &orphan, &root] {
            store.finish_span(&span.span_id, Tags::new());
        }

        let order: Vec<(String, usize)> = store
            .trace_timeline(&root.trace_id)
            .unwrap()
            .into_iter()
            .map(|e| (e.operation_name, e.level))
            .collect();
        assert_eq!(
            order,
            vec![
                ("root".to_string(), 0),
                ("late".to_string(), 1),
                ("leaf".to_string(), 2),
                ("orphan".to_string(), 0),
            ]
        );
        assert!(store.trace_timeline("nope").is_none());
    }

    #[test]
    fn search_filters_and_pages() {
        let (store, clock) = store();
        let mut ids = Vec::new();
        for (i, service) in ["api", "api", "billing"].iter().enumerate() {
            let span = store.start_span(
                StartSpan::new(format!("op-{i}"), *service).tag("tenant", if i == 0 { "acme" } else { "globex" }),
            );
            clock.advance_ms(100 * (i as i64 + 1));
            if i == 1 {
                store.set_status(&span.span_id, SpanStatusCode::Error, None);
            }
            store.finish_span(&span.span_id, Tags::new());
            ids.push(span.trace_id);
        }

        let all = store.search_traces(&TraceQuery::default());
        assert_eq!(all.total, 3);
        assert_eq!(all.traces[0].trace_id, ids[2]);

        let api = store.search_traces(&TraceQuery {
            service: Some("api".into()),
            ..TraceQuery::default()
        });
        assert_eq!(api.total, 2);

        let errors = store.search_traces(&TraceQuery {
            has_errors: Some(true),
            ..TraceQuery::default()
        });
        assert_eq!(errors.total, 1);
        assert_eq!(errors.traces[0].trace_id, ids[1]);

        let slow = store.search_traces(&TraceQuery {
            min_duration_ms: Some(200),
            max_duration_ms: Some(250),
            ..TraceQuery::default()
        });
        assert_eq!(slow.total, 1);

        let tagged = store.search_traces(&TraceQuery {
            tags: vec![TagFilter::new("tenant", "acme")],
            operation: Some("op-".into()),
            ..TraceQuery::default()
        });
        assert_eq!(tagged.total, 1);
        assert_eq!(tagged.traces[0].trace_id, ids[0]);

        let paged = store.search_traces(&TraceQuery {
            limit: 1,
            offset: 1,
            ..TraceQuery::default()
        });
        assert_eq!(paged.total, 3);
        assert_eq!(paged.traces.len(), 1);
        assert_eq!(paged.traces[0].trace_id, ids[1]);
        assert_eq!(store.recent_traces(2).len(), 2);
    }

    #[test]
    fn statistics_summarize_store() {
        let (store, clock) = store();
        let root = store.start_span(StartSpan::new("root", "api"));
        let child = store.start_span(StartSpan::new("child", "db").child_of(&root));
        clock.advance_ms(20);
        store.set_status(&child.span_id, SpanStatusCode::Error, None);
        store.finish_span(&child.span_id, Tags::new());
        let open = store.start_span(StartSpan::new("pending", "api"));

        let stats = store.statistics();
        assert_eq!(stats.total_traces, 1);
        assert_eq!(stats.total_spans, 3);
        assert_eq!(stats.open_spans, 2);
        assert_eq!(stats.services, 1);
        assert!((stats.error_rate - 1.0).abs() < f64::EPSILON);
        assert!(store.get_span(&open.span_id).unwrap().is_open());
    }
}
