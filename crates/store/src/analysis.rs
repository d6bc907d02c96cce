use std::collections::HashMap;
use std::time::Duration;

use vigil_core::model::trace::{Trace, TraceStatus};
use vigil_core::query::ServiceMetrics;

use crate::TraceStore;

const RANKING_SIZE: usize = 10;

/// Per-service latency and error statistics, refreshed on every completed trace.
pub(crate) struct PerformanceAnalyzer {
    slow_threshold_ms: i64,
    services: HashMap<String, ServiceMetrics>,
}

impl PerformanceAnalyzer {
    pub(crate) fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold_ms: i64::try_from(slow_threshold.as_millis()).unwrap_or(i64::MAX),
            services: HashMap::new(),
        }
    }

    pub(crate) fn record(&mut self, trace: &Trace) {
        let summary = trace.summary();

        for service in &trace.services {
            let metrics = self
                .services
                .entry(service.clone())
                .or_insert_with(|| ServiceMetrics {
                    service: service.clone(),
                    ..ServiceMetrics::default()
                });
            metrics.traces_observed += 1;

            let mut durations = Vec::new();
            let mut errors = 0usize;
            for span in trace.spans.iter().filter(|s| &s.service_name == service) {
                durations.push(span.duration_or_zero());
                if span.is_error() {
                    errors += 1;
                }
            }

            if !durations.is_empty() {
                durations.sort_unstable();
                let total: i64 = durations.iter().sum();
                metrics.average_duration_ms = total as f64 / durations.len() as f64;
                metrics.p50_duration_ms = percentile(&durations, 50.0);
                metrics.p90_duration_ms = percentile(&durations, 90.0);
                metrics.p95_duration_ms = percentile(&durations, 95.0);
                metrics.p99_duration_ms = percentile(&durations, 99.0);
                metrics.error_rate = errors as f64 / durations.len() as f64;
            }

            if trace.duration_ms > self.slow_threshold_ms {
                metrics.slowest_traces.push(summary.clone());
                metrics
                    .slowest_traces
                    .sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
                metrics.slowest_traces.truncate(RANKING_SIZE);
            }

            if trace.status == TraceStatus::Error {
                metrics.error_traces.push(summary.clone());
                if metrics.error_traces.len() > RANKING_SIZE {
                    let overflow = metrics.error_traces.len() - RANKING_SIZE;
                    metrics.error_traces.drain(..overflow);
                }
            }
        }
    }

    pub(crate) fn get(&self, service: &str) -> Option<ServiceMetrics> {
        self.services.get(service).cloned()
    }

    pub(crate) fn all(&self) -> Vec<ServiceMetrics> {
        let mut all: Vec<ServiceMetrics> = self.services.values().cloned().collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[i64], pct: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as i64 - 1;
    let idx = usize::try_from(rank.max(0)).unwrap_or(0);
    sorted[idx.min(sorted.len() - 1)]
}

impl TraceStore {
    pub fn service_metrics(&self, service: &str) -> Option<ServiceMetrics> {
        self.state().analyzer.get(service)
    }

    pub fn all_service_metrics(&self) -> Vec<ServiceMetrics> {
        self.state().analyzer.all()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testkit::ManualClock;
    use vigil_core::model::span::{SpanStatusCode, Tags};

    use super::percentile;
    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted: Vec<i64> = (1..=10).map(|v| v * 10).collect();
        assert_eq!(percentile(&sorted, 50.0), 50);
        assert_eq!(percentile(&sorted, 90.0), 90);
        assert_eq!(percentile(&sorted, 95.0), 100);
        assert_eq!(percentile(&sorted, 99.0), 100);
        assert_eq!(percentile(&[7], 1.0), 7);
        assert_eq!(percentile(&[], 50.0), 0);
    }

    #[test]
    fn completed_trace_updates_service_metrics() {
        let clock = ManualClock::at_base();
        let store = TraceStore::with_clock(TraceStoreConfig::default(), clock.shared());

        let root = store.start_span(StartSpan::new("GET /checkout", "api"));
        let mut db_spans = Vec::new();
        for _ in 0..4 {
            db_spans.push(store.start_span(StartSpan::new("SELECT", "db").child_of(&root)));
        }
        for (i, span) in db_spans.iter().enumerate() {
            clock.advance_ms(10 * (i as i64 + 1));
            if i == 3 {
                store.set_status(&span.span_id, SpanStatusCode::Error, None);
            }
            store.finish_span(&span.span_id, Tags::new());
        }
        assert!(store.service_metrics("db").is_none());
        store.finish_span(&root.span_id, Tags::new());

        let db = store.service_metrics("db").unwrap();
        assert_eq!(db.traces_observed, 1);
        assert!(db.p50_duration_ms <= db.p90_duration_ms);
        assert!(db.p90_duration_ms <= db.p95_duration_ms);
        assert!(db.p95_duration_ms <= db.p99_duration_ms);
        assert_eq!(db.p99_duration_ms, 100);
        assert!((db.error_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(db.error_traces.len(), 1);
        assert!(db.slowest_traces.is_empty());

        let names: Vec<String> = store
            .all_service_metrics()
            .into_iter()
            .map(|m| m.service)
            .collect();
        assert_eq!(names, vec!["api".to_string(), "db".to_string()]);
    }

    #[test]
    fn slow_traces_are_ranked_above_threshold() {
        let clock = ManualClock::at_base();
        let config = TraceStoreConfig {
            slow_trace_threshold: Duration::from_millis(100),
            ..TraceStoreConfig::default()
        };
        let store = TraceStore::with_clock(config, clock.shared());

        for ms in [50, 300, 200] {
            let span = store.start_span(StartSpan::new("job", "worker"));
            clock.advance_ms(ms);
            store.finish_span(&span.span_id, Tags::new());
        }

        let worker = store.service_metrics("worker").unwrap();
        let ranked: Vec<i64> = worker.slowest_traces.iter().map(|t| t.duration_ms).collect();
        assert_eq!(ranked, vec![300, 200]);
        assert_eq!(worker.traces_observed, 3);
    }
}
