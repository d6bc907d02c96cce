use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use vigil_core::config::Config;
use vigil_core::event::TraceEvent;
use vigil_core::model::span::Span;
use vigil_core::model::trace::{Trace, TraceStatus};
use vigil_core::time::{SharedClock, system_clock};

use crate::analysis::PerformanceAnalyzer;
use crate::graph::DependencyGraphBuilder;
use crate::sampling::SamplingController;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceStoreConfig {
    pub retention: Duration,
    pub max_traces: usize,
    pub max_spans_per_trace: usize,
    pub slow_trace_threshold: Duration,
    pub sampling_rate: f64,
    pub adaptive_sampling: bool,
    pub sampling_high_water: f64,
    pub sampling_low_water: f64,
}

impl Default for TraceStoreConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for TraceStoreConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            retention: cfg.trace_retention,
            max_traces: cfg.max_traces,
            max_spans_per_trace: cfg.max_spans_per_trace.max(1),
            slow_trace_threshold: cfg.slow_trace_threshold,
            sampling_rate: cfg.sampling_rate,
            adaptive_sampling: cfg.adaptive_sampling,
            sampling_high_water: cfg.sampling_high_water,
            sampling_low_water: cfg.sampling_low_water,
        }
    }
}

/// Assembled trace. Spans live in the span arena and are referenced by id.
#[derive(Debug, Clone)]
pub(crate) struct TraceEntry {
    pub(crate) trace_id: String,
    pub(crate) span_ids: Vec<String>,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: DateTime<Utc>,
    pub(crate) services: Vec<String>,
    pub(crate) error_count: usize,
    pub(crate) status: TraceStatus,
    pub(crate) root_span_id: Option<String>,
    pub(crate) complete: bool,
}

impl TraceEntry {
    pub(crate) fn new(trace_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            span_ids: Vec::new(),
            start_time: at,
            end_time: at,
            services: Vec::new(),
            error_count: 0,
            status: TraceStatus::Success,
            root_span_id: None,
            complete: false,
        }
    }

    pub(crate) fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }

    pub(crate) fn spans<'a>(&'a self, arena: &'a HashMap<String, Span>) -> impl Iterator<Item = &'a Span> {
        self.span_ids.iter().filter_map(|id| arena.get(id))
    }

    pub(crate) fn materialize(&self, arena: &HashMap<String, Span>) -> Trace {
        Trace {
            trace_id: self.trace_id.clone(),
            spans: self.spans(arena).cloned().collect(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration_ms(),
            services: self.services.clone(),
            operations_count: self.span_ids.len(),
            error_count: self.error_count,
            status: self.status,
            root_span_id: self.root_span_id.clone(),
            complete: self.complete,
        }
    }
}

pub(crate) struct State {
    pub(crate) spans: HashMap<String, Span>,
    /// Open span count per trace id; a trace is complete when it has no entry.
    pub(crate) open_by_trace: HashMap<String, usize>,
    /// Service of the parent span, captured when a cross-service child starts.
    pub(crate) callers: HashMap<String, String>,
    pub(crate) traces: HashMap<String, TraceEntry>,
    pub(crate) analyzer: PerformanceAnalyzer,
    pub(crate) graph: DependencyGraphBuilder,
    pub(crate) sampler: SamplingController,
}

impl State {
    pub(crate) fn open_spans(&self) -> usize {
        self.open_by_trace.values().sum()
    }
}

#[derive(Clone)]
pub struct TraceStore {
    state: Arc<Mutex<State>>,
    config: TraceStoreConfig,
    clock: SharedClock,
    events: broadcast::Sender<TraceEvent>,
}

impl TraceStore {
    pub fn new(config: TraceStoreConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: TraceStoreConfig, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(8192);
        let state = State {
            spans: HashMap::new(),
            open_by_trace: HashMap::new(),
            callers: HashMap::new(),
            traces: HashMap::new(),
            analyzer: PerformanceAnalyzer::new(config.slow_trace_threshold),
            graph: DependencyGraphBuilder::default(),
            sampler: SamplingController::new(
                config.sampling_rate,
                config.adaptive_sampling,
                config.sampling_high_water,
                config.sampling_low_water,
            ),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            config,
            clock,
            events,
        }
    }

    pub fn config(&self) -> &TraceStoreConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: TraceEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_empty() {
        let store = TraceStore::new(TraceStoreConfig::default());
        let stats = store.statistics();
        assert_eq!(stats.total_traces, 0);
        assert_eq!(stats.total_spans, 0);
        assert_eq!(stats.open_spans, 0);
        assert_eq!(stats.sampling_rate, 1.0);
    }

    #[test]
    fn config_derives_from_app_config() {
        let mut app = Config::default();
        app.max_traces = 7;
        app.max_spans_per_trace = 0;
        let cfg = TraceStoreConfig::from(&app);
        assert_eq!(cfg.max_traces, 7);
        assert_eq!(cfg.max_spans_per_trace, 1);
    }
}
