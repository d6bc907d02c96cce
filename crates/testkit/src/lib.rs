use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use vigil_core::error::{Result, VigilError};
use vigil_core::model::alert::{Alert, Severity};
use vigil_core::model::rule::{
    ActionConfig, ActionKind, AlertAction, AlertCondition, AlertRule, ConditionConfig,
    ConditionKind, EscalationCondition, EscalationLevel, EscalationPolicy, Operator,
};
use vigil_core::provider::{
    Delivery, HealthSource, LogSource, MetricSource, NotificationTransport, ServiceHealth,
};
use vigil_core::time::{Clock, SharedClock};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn at_base() -> Self {
        Self::new(base_time())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(Duration::minutes(minutes));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Clone, Default)]
pub struct StaticMetrics {
    current: Arc<Mutex<HashMap<String, f64>>>,
    baseline: Arc<Mutex<HashMap<String, f64>>>,
}

fn metric_key(metric: &str, service: Option<&str>) -> String {
    match service {
        Some(s) => format!("{metric}@{s}"),
        None => metric.to_string(),
    }
}

impl StaticMetrics {
    pub fn set(&self, metric: &str, value: f64) {
        self.current
            .lock()
            .unwrap()
            .insert(metric_key(metric, None), value);
    }

    pub fn set_for(&self, metric: &str, service: &str, value: f64) {
        self.current
            .lock()
            .unwrap()
            .insert(metric_key(metric, Some(service)), value);
    }

    pub fn set_baseline(&self, metric: &str, value: f64) {
        self.baseline
            .lock()
            .unwrap()
            .insert(metric_key(metric, None), value);
    }

    pub fn clear(&self, metric: &str) {
        self.current.lock().unwrap().remove(metric);
    }
}

#[async_trait]
impl MetricSource for StaticMetrics {
    async fn snapshot(
        &self,
        metric: &str,
        service: Option<&str>,
        _window: Option<StdDuration>,
    ) -> Option<f64> {
        let current = self.current.lock().unwrap();
        current
            .get(&metric_key(metric, service))
            .or_else(|| current.get(metric))
            .copied()
    }

    async fn baseline(
        &self,
        metric: &str,
        service: Option<&str>,
        _window: StdDuration,
    ) -> Option<f64> {
        let baseline = self.baseline.lock().unwrap();
        baseline
            .get(&metric_key(metric, service))
            .or_else(|| baseline.get(metric))
            .copied()
    }
}

#[derive(Clone, Default)]
pub struct StaticLogs {
    lines: Arc<Mutex<Vec<String>>>,
}

impl StaticLogs {
    pub fn push(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

#[async_trait]
impl LogSource for StaticLogs {
    async fn recent(&self, _service: Option<&str>, _window: Option<StdDuration>) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
pub struct StaticHealth {
    statuses: Arc<Mutex<Vec<ServiceHealth>>>,
}

impl StaticHealth {
    pub fn set(&self, service: &str, healthy: bool) {
        let mut statuses = self.statuses.lock().unwrap();
        statuses.retain(|s| s.service != service);
        statuses.push(ServiceHealth {
            service: service.to_string(),
            healthy,
            detail: None,
        });
    }
}

#[async_trait]
impl HealthSource for StaticHealth {
    async fn statuses(&self) -> Vec<ServiceHealth> {
        self.statuses.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub alert_id: String,
    pub kind: ActionKind,
    pub recipient: String,
}

/// Transport that succeeds and remembers every delivery.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn deliver(&self, alert: &Alert, action: &AlertAction) -> Result<Delivery> {
        let recipient = action.recipient();
        self.sent.lock().unwrap().push(SentNotification {
            alert_id: alert.id.clone(),
            kind: action.kind,
            recipient: recipient.clone(),
        });
        Ok(Delivery { recipient })
    }
}

/// Transport that fails its first `failures` deliveries, then succeeds.
#[derive(Clone)]
pub struct FlakyTransport {
    remaining_failures: Arc<Mutex<usize>>,
    attempts: Arc<Mutex<usize>>,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: Arc::new(Mutex::new(failures)),
            attempts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl NotificationTransport for FlakyTransport {
    async fn deliver(&self, _alert: &Alert, action: &AlertAction) -> Result<Delivery> {
        *self.attempts.lock().unwrap() += 1;
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(VigilError::Delivery("simulated outage".to_string()));
        }
        Ok(Delivery {
            recipient: action.recipient(),
        })
    }
}

pub fn email_action(recipient: &str, retry_attempts: u32, retry_delay_minutes: u64) -> AlertAction {
    AlertAction {
        kind: ActionKind::Email,
        config: ActionConfig {
            recipients: vec![recipient.to_string()],
            ..ActionConfig::default()
        },
        retry_attempts,
        retry_delay_minutes,
    }
}

pub fn metric_condition(metric: &str, operator: Operator, threshold: f64) -> AlertCondition {
    AlertCondition {
        kind: ConditionKind::MetricThreshold,
        config: ConditionConfig {
            metric: Some(metric.to_string()),
            operator: Some(operator),
            threshold: Some(threshold),
            ..ConditionConfig::default()
        },
    }
}

pub fn rule(id: &str, conditions: Vec<AlertCondition>, actions: Vec<AlertAction>) -> AlertRule {
    AlertRule {
        id: id.to_string(),
        name: id.replace('-', " "),
        description: String::new(),
        severity: Severity::Warning,
        enabled: true,
        conditions,
        actions,
        cooldown_minutes: 0,
        tags: Vec::new(),
        escalation_policy: None,
        created_at: base_time(),
        updated_at: base_time(),
    }
}

/// `system.cpu.usage > threshold`, warning, one email action, 5 minute cooldown.
pub fn cpu_rule(threshold: f64) -> AlertRule {
    let mut rule = rule(
        "high-cpu",
        vec![metric_condition("system.cpu.usage", Operator::Gt, threshold)],
        vec![email_action("ops@example.com", 0, 0)],
    );
    rule.name = "High CPU Usage".to_string();
    rule.cooldown_minutes = 5;
    rule
}

pub fn tiered_policy(id: &str, delays: &[u64], condition: EscalationCondition) -> EscalationPolicy {
    EscalationPolicy {
        id: id.to_string(),
        name: id.to_string(),
        enabled: true,
        levels: delays
            .iter()
            .enumerate()
            .map(|(i, delay)| EscalationLevel {
                delay_minutes: *delay,
                actions: vec![email_action(&format!("level{i}@example.com"), 0, 0)],
                condition,
            })
            .collect(),
    }
}
