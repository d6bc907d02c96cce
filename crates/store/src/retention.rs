use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::time::before;

use crate::TraceStore;
use crate::db::State;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Complete traces older than the retention window.
    pub expired: usize,
    /// Complete traces dropped to get back under the trace ceiling.
    pub evicted: usize,
}

impl TraceStore {
    /// Drops old complete traces, then the oldest complete ones while over
    /// `max_traces`. Incomplete traces are never touched.
    pub fn run_retention(&self, now: DateTime<Utc>) -> RetentionReport {
        let cutoff = before(now, self.config().retention);
        let max_traces = self.config().max_traces;
        let mut state = self.state();

        let expired: Vec<String> = state
            .traces
            .values()
            .filter(|t| t.complete && t.end_time < cutoff)
            .map(|t| t.trace_id.clone())
            .collect();
        for trace_id in &expired {
            remove_trace(&mut state, trace_id);
        }

        let mut evicted = 0;
        if state.traces.len() > max_traces {
            let mut candidates: Vec<(DateTime<Utc>, String)> = state
                .traces
                .values()
                .filter(|t| t.complete)
                .map(|t| (t.end_time, t.trace_id.clone()))
                .collect();
            candidates.sort();

            let excess = state.traces.len() - max_traces;
            for (_, trace_id) in candidates.into_iter().take(excess) {
                remove_trace(&mut state, &trace_id);
                evicted += 1;
            }
        }

        let report = RetentionReport {
            expired: expired.len(),
            evicted,
        };
        if report.expired > 0 || report.evicted > 0 {
            tracing::info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = state.traces.len(),
                "trace retention pass"
            );
        }
        report
    }

    /// Retention plus one adaptive sampling step.
    pub fn run_maintenance(&self) -> RetentionReport {
        let report = self.run_retention(self.now());

        let mut state = self.state();
        let trace_count = state.traces.len();
        let before = state.sampler.rate();
        let after = state.sampler.adjust(trace_count, self.config().retention);
        if (after - before).abs() > f64::EPSILON {
            tracing::info!(from = before, to = after, traces = trace_count, "sampling rate adjusted");
        }
        report
    }
}

fn remove_trace(state: &mut State, trace_id: &str) {
    if let Some(entry) = state.traces.remove(trace_id) {
        for span_id in &entry.span_ids {
            state.spans.remove(span_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testkit::ManualClock;
    use vigil_core::model::span::Tags;
    use vigil_core::time::Clock;

    use crate::{StartSpan, TraceStore, TraceStoreConfig};

    fn finished_trace(store: &TraceStore, clock: &ManualClock, op: &str) -> String {
        let span = store.start_span(StartSpan::new(op, "api"));
        clock.advance_ms(10);
        store.finish_span(&span.span_id, Tags::new());
        span.trace_id
    }

    #[test]
    fn expired_traces_are_removed_with_their_spans() {
        let clock = ManualClock::at_base();
        let config = TraceStoreConfig {
            retention: Duration::from_secs(60),
            ..TraceStoreConfig::default()
        };
        let store = TraceStore::with_clock(config, clock.shared());

        let old = finished_trace(&store, &clock, "old");
        clock.advance_minutes(5);
        let fresh = finished_trace(&store, &clock, "fresh");

        let report = store.run_retention(clock.now());
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 0);
        assert!(store.get_trace(&old).is_none());
        assert!(store.get_trace(&fresh).is_some());
        assert_eq!(store.statistics().total_spans, 1);
    }

    #[test]
    fn ceiling_evicts_oldest_complete_traces_only() {
        let clock = ManualClock::at_base();
        let config = TraceStoreConfig {
            max_traces: 2,
            ..TraceStoreConfig::default()
        };
        let store = TraceStore::with_clock(config, clock.shared());

        // open root with one finished child: an incomplete, oldest trace
        let open_root = store.start_span(StartSpan::new("long poll", "api"));
        let child = store.start_span(StartSpan::new("tick", "api").child_of(&open_root));
        clock.advance_ms(1);
        store.finish_span(&child.span_id, Tags::new());

        let a = finished_trace(&store, &clock, "a");
        let b = finished_trace(&store, &clock, "b");
        let c = finished_trace(&store, &clock, "c");

        let report = store.run_retention(clock.now());
        assert_eq!(report.evicted, 2);
        assert!(store.get_trace(&open_root.trace_id).is_some());
        assert!(store.get_trace(&a).is_none());
        assert!(store.get_trace(&b).is_none());
        assert!(store.get_trace(&c).is_some());
    }

    #[test]
    fn maintenance_adjusts_sampling() {
        let clock = ManualClock::at_base();
        let config = TraceStoreConfig {
            sampling_rate: 0.5,
            ..TraceStoreConfig::default()
        };
        let store = TraceStore::with_clock(config, clock.shared());
        finished_trace(&store, &clock, "only");

        store.run_maintenance();
        assert!((store.sampling_rate() - 0.55).abs() < 1e-9);
    }
}
