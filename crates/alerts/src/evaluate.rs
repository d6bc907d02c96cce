//! Condition evaluators. Each condition type maps to one evaluator; a rule
//! fires only when every one of its conditions is met.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::RegexBuilder;
use serde_json::{Map, Value, json};
use vigil_core::model::rule::{ConditionConfig, ConditionKind, Operator};
use vigil_core::provider::{HealthSource, LogSource, MetricSource};

const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(300);
const MAX_CONTEXT_MATCHES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionResult {
    pub met: bool,
    pub context: Map<String, Value>,
}

impl ConditionResult {
    pub fn met(context: Map<String, Value>) -> Self {
        Self { met: true, context }
    }

    pub fn unmet(context: Map<String, Value>) -> Self {
        Self {
            met: false,
            context,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut context = Map::new();
        context.insert("error".into(), Value::String(message.into()));
        Self::unmet(context)
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.context.get("error").and_then(Value::as_str)
    }
}

fn outcome(met: bool, context: Value) -> ConditionResult {
    let context = match context {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ConditionResult { met, context }
}

#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(&self, config: &ConditionConfig) -> ConditionResult;
}

fn window(config: &ConditionConfig) -> Option<Duration> {
    config.window_secs.map(Duration::from_secs)
}

pub struct MetricThresholdEvaluator {
    source: Arc<dyn MetricSource>,
}

impl MetricThresholdEvaluator {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ConditionEvaluator for MetricThresholdEvaluator {
    async fn evaluate(&self, config: &ConditionConfig) -> ConditionResult {
        let Some(metric) = config.metric.as_deref() else {
            return ConditionResult::error("metric_threshold condition has no metric");
        };
        let operator = config.operator.unwrap_or_default();
        let threshold = config.threshold.unwrap_or(0.0);

        let Some(value) = self
            .source
            .snapshot(metric, config.service.as_deref(), window(config))
            .await
        else {
            return ConditionResult::error(format!("no reading for metric {metric}"))
                .with("metric", json!(metric));
        };

        outcome(
            operator.compare(value, threshold),
            json!({
                "metric": metric,
                "service": config.service,
                "current_value": value,
                "threshold": threshold,
                "operator": operator.symbol(),
            }),
        )
    }
}

pub struct LogPatternEvaluator {
    source: Arc<dyn LogSource>,
}

impl LogPatternEvaluator {
    pub fn new(source: Arc<dyn LogSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ConditionEvaluator for LogPatternEvaluator {
    async fn evaluate(&self, config: &ConditionConfig) -> ConditionResult {
        let Some(pattern) = config.pattern.as_deref() else {
            return ConditionResult::error("log_pattern condition has no pattern");
        };
        let regex = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => regex,
            Err(err) => {
                return ConditionResult::error(format!("invalid pattern: {err}"))
                    .with("pattern", json!(pattern));
            }
        };

        let lines = self
            .source
            .recent(config.service.as_deref(), window(config))
            .await;
        let matches: Vec<&String> = lines.iter().filter(|line| regex.is_match(line)).collect();
        let threshold = config.threshold.unwrap_or(0.0);
        let count = matches.len();

        outcome(
            count as f64 > threshold,
            json!({
                "pattern": pattern,
                "service": config.service,
                "match_count": count,
                "recent_matches": matches.into_iter().take(MAX_CONTEXT_MATCHES).collect::<Vec<_>>(),
            }),
        )
    }
}

pub struct HealthStatusEvaluator {
    source: Arc<dyn HealthSource>,
}

impl HealthStatusEvaluator {
    pub fn new(source: Arc<dyn HealthSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ConditionEvaluator for HealthStatusEvaluator {
    async fn evaluate(&self, config: &ConditionConfig) -> ConditionResult {
        let wanted = config.service.as_deref().filter(|s| *s != "any");
        let statuses: Vec<_> = self
            .source
            .statuses()
            .await
            .into_iter()
            .filter(|s| wanted.is_none_or(|w| s.service == w))
            .collect();
        let unhealthy: Vec<&str> = statuses
            .iter()
            .filter(|s| !s.healthy)
            .map(|s| s.service.as_str())
            .collect();
        let threshold = config.threshold.unwrap_or(0.0);

        // With a wildcard, attribute the alert to the first failing service.
        let service = wanted.or_else(|| unhealthy.first().copied());
        outcome(
            unhealthy.len() as f64 > threshold,
            json!({
                "service": service,
                "unhealthy_services": unhealthy,
                "total_services": statuses.len(),
            }),
        )
    }
}

pub struct RateChangeEvaluator {
    source: Arc<dyn MetricSource>,
}

impl RateChangeEvaluator {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ConditionEvaluator for RateChangeEvaluator {
    async fn evaluate(&self, config: &ConditionConfig) -> ConditionResult {
        let Some(metric) = config.metric.as_deref() else {
            return ConditionResult::error("rate_change condition has no metric");
        };
        let service = config.service.as_deref();
        let span = window(config).unwrap_or(DEFAULT_RATE_WINDOW);

        let current = self.source.snapshot(metric, service, Some(span)).await;
        let baseline = self.source.baseline(metric, service, span).await;
        let (current, baseline) = match (current, baseline) {
            (Some(c), Some(b)) if b != 0.0 => (c, b),
            _ => {
                return ConditionResult::error(format!("no usable baseline for metric {metric}"))
                    .with("metric", json!(metric));
            }
        };

        let change = (current - baseline) / baseline * 100.0;
        let operator = config.operator.unwrap_or(Operator::Gt);
        let threshold = config.threshold.unwrap_or(0.0);
        outcome(
            operator.compare(change, threshold),
            json!({
                "metric": metric,
                "service": config.service,
                "current_rate": current,
                "baseline_rate": baseline,
                "change_percent": change,
                "threshold": threshold,
                "operator": operator.symbol(),
            }),
        )
    }
}

pub type CustomCheck =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<bool, String>> + Send + Sync>;

/// Named predicates registered at runtime.
#[derive(Default)]
pub struct CustomEvaluator {
    checks: Mutex<HashMap<String, CustomCheck>>,
}

impl CustomEvaluator {
    pub fn register(&self, name: impl Into<String>, check: CustomCheck) {
        self.checks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), check);
    }

    fn lookup(&self, name: &str) -> Option<CustomCheck> {
        self.checks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl ConditionEvaluator for CustomEvaluator {
    async fn evaluate(&self, config: &ConditionConfig) -> ConditionResult {
        let Some(name) = config.check.as_deref() else {
            return ConditionResult::error("custom condition has no check name");
        };
        let Some(check) = self.lookup(name) else {
            return ConditionResult::error(format!("no custom check registered as {name}"))
                .with("check", json!(name));
        };

        match check().await {
            Ok(met) => outcome(met, json!({ "check": name })),
            Err(err) => ConditionResult::error(err).with("check", json!(name)),
        }
    }
}

pub struct EvaluatorRegistry {
    evaluators: HashMap<ConditionKind, Arc<dyn ConditionEvaluator>>,
    custom: Arc<CustomEvaluator>,
}

impl EvaluatorRegistry {
    /// Registry holding only the custom-check evaluator.
    pub fn new() -> Self {
        let custom = Arc::new(CustomEvaluator::default());
        let mut evaluators: HashMap<ConditionKind, Arc<dyn ConditionEvaluator>> = HashMap::new();
        evaluators.insert(ConditionKind::Custom, custom.clone());
        Self { evaluators, custom }
    }

    /// All built-in evaluators wired to the given signal sources.
    pub fn with_sources(
        metrics: Arc<dyn MetricSource>,
        logs: Arc<dyn LogSource>,
        health: Arc<dyn HealthSource>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            ConditionKind::MetricThreshold,
            Arc::new(MetricThresholdEvaluator::new(metrics.clone())),
        );
        registry.register(ConditionKind::RateChange, Arc::new(RateChangeEvaluator::new(metrics)));
        registry.register(ConditionKind::LogPattern, Arc::new(LogPatternEvaluator::new(logs)));
        registry.register(
            ConditionKind::HealthStatus,
            Arc::new(HealthStatusEvaluator::new(health)),
        );
        registry
    }

    pub fn register(&mut self, kind: ConditionKind, evaluator: Arc<dyn ConditionEvaluator>) {
        self.evaluators.insert(kind, evaluator);
    }

    pub fn register_check(&self, name: impl Into<String>, check: CustomCheck) {
        self.custom.register(name, check);
    }

    pub fn get(&self, kind: ConditionKind) -> Option<Arc<dyn ConditionEvaluator>> {
        self.evaluators.get(&kind).cloned()
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
