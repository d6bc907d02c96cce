//! In-memory signal sources fed by the daemon API: metric points, log lines
//! and service health.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_core::provider::{HealthSource, LogSource, MetricSource, ServiceHealth};
use vigil_core::time::{SharedClock, before, system_clock};

const MAX_POINTS_PER_SERIES: usize = 1_000;
const MAX_LOG_LINES: usize = 1_000;

type SeriesKey = (String, Option<String>);

#[derive(Debug)]
struct LogLine {
    at: DateTime<Utc>,
    service: Option<String>,
    line: String,
}

#[derive(Default)]
struct Signals {
    metrics: HashMap<SeriesKey, VecDeque<(DateTime<Utc>, f64)>>,
    logs: VecDeque<LogLine>,
    health: BTreeMap<String, ServiceHealth>,
}

pub struct SignalBuffer {
    clock: SharedClock,
    inner: Mutex<Signals>,
}

impl SignalBuffer {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: Mutex::new(Signals::default()),
        }
    }

    fn signals(&self) -> MutexGuard<'_, Signals> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_metric(&self, metric: &str, service: Option<&str>, value: f64) {
        let now = self.clock.now();
        let mut signals = self.signals();
        let series = signals
            .metrics
            .entry((metric.to_string(), service.map(str::to_string)))
            .or_default();
        series.push_back((now, value));
        while series.len() > MAX_POINTS_PER_SERIES {
            series.pop_front();
        }
    }

    pub fn record_log(&self, service: Option<&str>, line: &str) {
        let now = self.clock.now();
        let mut signals = self.signals();
        signals.logs.push_back(LogLine {
            at: now,
            service: service.map(str::to_string),
            line: line.to_string(),
        });
        while signals.logs.len() > MAX_LOG_LINES {
            signals.logs.pop_front();
        }
    }

    pub fn record_health(&self, health: ServiceHealth) {
        self.signals().health.insert(health.service.clone(), health);
    }

    /// Points of every matching series within `[from, to)`; a missing service
    /// matches all series of the metric.
    fn points_between(
        &self,
        metric: &str,
        service: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, f64)> {
        let signals = self.signals();
        signals
            .metrics
            .iter()
            .filter(|((name, svc), _)| {
                name == metric && service.is_none_or(|s| svc.as_deref() == Some(s))
            })
            .flat_map(|(_, points)| points.iter().copied())
            .filter(|(at, _)| from.is_none_or(|f| *at >= f) && *at <= to)
            .collect()
    }
}

impl Default for SignalBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn mean(points: &[(DateTime<Utc>, f64)]) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    Some(points.iter().map(|(_, v)| v).sum::<f64>() / points.len() as f64)
}

#[async_trait]
impl MetricSource for SignalBuffer {
    /// Mean over the window, or the latest point when no window is given.
    async fn snapshot(
        &self,
        metric: &str,
        service: Option<&str>,
        window: Option<Duration>,
    ) -> Option<f64> {
        let now = self.clock.now();
        match window {
            Some(window) => {
                let from = before(now, window);
                mean(&self.points_between(metric, service, Some(from), now))
            }
            None => self
                .points_between(metric, service, None, now)
                .into_iter()
                .max_by_key(|(at, _)| *at)
                .map(|(_, v)| v),
        }
    }

    async fn baseline(
        &self,
        metric: &str,
        service: Option<&str>,
        window: Duration,
    ) -> Option<f64> {
        let now = self.clock.now();
        let end = before(now, window);
        let points: Vec<_> = self
            .points_between(metric, service, Some(before(end, window)), end)
            .into_iter()
            .filter(|(at, _)| *at < end)
            .collect();
        mean(&points)
    }
}

#[async_trait]
impl LogSource for SignalBuffer {
    async fn recent(&self, service: Option<&str>, window: Option<Duration>) -> Vec<String> {
        let cutoff = window.map(|w| before(self.clock.now(), w));
        self.signals()
            .logs
            .iter()
            .filter(|l| cutoff.is_none_or(|c| l.at >= c))
            .filter(|l| service.is_none_or(|s| l.service.as_deref() == Some(s)))
            .map(|l| l.line.clone())
            .collect()
    }
}

#[async_trait]
impl HealthSource for SignalBuffer {
    async fn statuses(&self) -> Vec<ServiceHealth> {
        self.signals().health.values().cloned().collect()
    }
}
