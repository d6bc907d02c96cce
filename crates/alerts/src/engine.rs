use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vigil_core::config::Config;
use vigil_core::event::AlertEvent;
use vigil_core::ids::{mint_alert_id, mint_notification_id};
use vigil_core::model::alert::{Alert, AlertSource, AlertStatus, NotificationRecord};
use vigil_core::model::rule::{AlertAction, AlertRule, EscalationPolicy, RuleUpdate};
use vigil_core::query::AlertStatistics;
use vigil_core::time::{SharedClock, after_minutes, minutes, system_clock};

use crate::defaults::{default_policies, default_rules};
use crate::dispatch::TransportRegistry;
use crate::escalation;
use crate::evaluate::{ConditionResult, CustomCheck, EvaluatorRegistry};
use crate::persist::StateStore;
use crate::scheduler::{TimerJob, TimerKey, TimerQueue};
use crate::state::AlertBook;

const MIN_LOOP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct AlertEngineConfig {
    pub evaluation_interval: Duration,
    pub timer_interval: Duration,
    pub maintenance_interval: Duration,
    pub max_history: usize,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(30),
            timer_interval: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(60),
            max_history: 10_000,
        }
    }
}

impl From<&Config> for AlertEngineConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            evaluation_interval: cfg.alert_evaluation_interval,
            timer_interval: cfg.alert_timer_interval,
            maintenance_interval: cfg.alert_maintenance_interval,
            max_history: cfg.max_alert_history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    CoolingDown,
    NotMet { context: Map<String, Value> },
    /// `alert_id` is `None` when an active alert for the rule already existed.
    Triggered { alert_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    #[serde(flatten)]
    pub outcome: EvaluationOutcome,
}

struct Inner {
    rules: BTreeMap<String, AlertRule>,
    policies: BTreeMap<String, EscalationPolicy>,
    last_trigger: HashMap<String, DateTime<Utc>>,
    book: AlertBook,
    timers: TimerQueue,
}

/// Rule evaluation, alert lifecycle, notification retries and escalation.
#[derive(Clone)]
pub struct AlertEngine {
    inner: Arc<Mutex<Inner>>,
    evaluators: Arc<EvaluatorRegistry>,
    transports: Arc<TransportRegistry>,
    store: Option<Arc<dyn StateStore>>,
    clock: SharedClock,
    events: broadcast::Sender<AlertEvent>,
    config: AlertEngineConfig,
}

impl AlertEngine {
    pub fn new(
        config: AlertEngineConfig,
        evaluators: EvaluatorRegistry,
        transports: TransportRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let inner = Inner {
            rules: BTreeMap::new(),
            policies: BTreeMap::new(),
            last_trigger: HashMap::new(),
            book: AlertBook::new(config.max_history),
            timers: TimerQueue::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            evaluators: Arc::new(evaluators),
            transports: Arc::new(transports),
            store: None,
            clock: system_clock(),
            events,
            config,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Installs the stock rules and the standard escalation policy.
    pub fn with_defaults(self) -> Self {
        let now = self.now();
        {
            let mut inner = self.inner();
            for policy in default_policies() {
                inner.policies.insert(policy.id.clone(), policy);
            }
            for rule in default_rules(now) {
                inner.rules.insert(rule.id.clone(), rule);
            }
        }
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn publish(&self, event: AlertEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &AlertEngineConfig {
        &self.config
    }

    pub fn register_check(&self, name: impl Into<String>, check: CustomCheck) {
        self.evaluators.register_check(name, check);
    }

    pub fn add_rule(&self, mut rule: AlertRule) {
        rule.updated_at = self.now();
        tracing::info!(rule_id = %rule.id, rule = %rule.name, "alert rule added");
        self.inner().rules.insert(rule.id.clone(), rule);
    }

    pub fn update_rule(&self, rule_id: &str, update: RuleUpdate) -> bool {
        let now = self.now();
        let mut inner = self.inner();
        let Some(rule) = inner.rules.get_mut(rule_id) else {
            tracing::warn!(rule_id, "update ignored: unknown rule");
            return false;
        };
        update.apply(rule, now);
        tracing::info!(rule_id, "alert rule updated");
        true
    }

    /// Pending retries and escalations of the rule's alerts keep running.
    pub fn delete_rule(&self, rule_id: &str) -> bool {
        let mut inner = self.inner();
        inner.last_trigger.remove(rule_id);
        let removed = inner.rules.remove(rule_id).is_some();
        if removed {
            tracing::info!(rule_id, "alert rule deleted");
        }
        removed
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        self.update_rule(
            rule_id,
            RuleUpdate {
                enabled: Some(enabled),
                ..RuleUpdate::default()
            },
        )
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.inner().rules.values().cloned().collect()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.inner().rules.get(rule_id).cloned()
    }

    pub fn add_policy(&self, policy: EscalationPolicy) {
        tracing::info!(policy = %policy.id, levels = policy.levels.len(), "escalation policy added");
        self.inner().policies.insert(policy.id.clone(), policy);
    }

    pub fn policies(&self) -> Vec<EscalationPolicy> {
        self.inner().policies.values().cloned().collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner().book.active_alerts()
    }

    pub fn get_alert(&self, alert_id: &str) -> Option<Alert> {
        self.inner().book.get(alert_id).cloned()
    }

    pub fn statistics(&self) -> AlertStatistics {
        self.inner().book.statistics()
    }

    pub fn pending_timers(&self) -> usize {
        self.inner().timers.pending()
    }

    pub fn acknowledge(&self, alert_id: &str, by: Option<&str>) -> bool {
        let now = self.now();
        let by = by.unwrap_or("unknown");
        let acked = self.inner().book.acknowledge(alert_id, by, now);
        match acked {
            Some(alert) => {
                tracing::info!(alert_id, by, "alert acknowledged");
                self.publish(AlertEvent::Acknowledged(alert));
                true
            }
            None => {
                tracing::warn!(alert_id, "acknowledge ignored: no active alert with that id");
                false
            }
        }
    }

    /// Resolving also drops the alert's pending escalation levels.
    pub fn resolve(&self, alert_id: &str, by: Option<&str>) -> bool {
        let now = self.now();
        let by = by.unwrap_or("system");
        let resolved = {
            let mut inner = self.inner();
            let resolved = inner.book.resolve(alert_id, by, now);
            if resolved.is_some() {
                inner.timers.cancel_escalations(alert_id);
            }
            resolved
        };
        match resolved {
            Some(alert) => {
                tracing::info!(alert_id, by, "alert resolved");
                self.publish(AlertEvent::Resolved(alert));
                true
            }
            None => {
                tracing::warn!(alert_id, "resolve ignored: no open alert with that id");
                false
            }
        }
    }

    pub fn suppress(&self, alert_id: &str, duration_minutes: u64) -> bool {
        let until = after_minutes(self.now(), duration_minutes);
        let suppressed = self.inner().book.suppress(alert_id, until);
        match suppressed {
            Some(alert) => {
                tracing::info!(alert_id, until = %until, "alert suppressed");
                self.publish(AlertEvent::Suppressed(alert));
                true
            }
            None => {
                tracing::warn!(alert_id, "suppress ignored: no active alert with that id");
                false
            }
        }
    }

    /// One pass over every enabled rule.
    pub async fn evaluate_all(&self) -> Vec<RuleEvaluation> {
        let rules: Vec<AlertRule> = self
            .inner()
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        let mut out = Vec::with_capacity(rules.len());
        for rule in rules {
            let outcome = self.evaluate_rule(&rule).await;
            out.push(RuleEvaluation {
                rule_id: rule.id,
                outcome,
            });
        }
        out
    }

    async fn evaluate_rule(&self, rule: &AlertRule) -> EvaluationOutcome {
        let now = self.now();
        if self.cooling_down(rule, now) {
            return EvaluationOutcome::CoolingDown;
        }

        let mut context = Map::new();
        for condition in &rule.conditions {
            let result = match self.evaluators.get(condition.kind) {
                Some(evaluator) => evaluator.evaluate(&condition.config).await,
                None => ConditionResult::error(format!(
                    "no evaluator registered for {}",
                    condition.kind.as_str()
                )),
            };
            if let Some(err) = result.error_message() {
                tracing::warn!(
                    rule = %rule.name,
                    condition = condition.kind.as_str(),
                    error = %err,
                    "condition evaluation failed"
                );
            }
            if !result.met {
                return EvaluationOutcome::NotMet {
                    context: result.context,
                };
            }
            context.extend(result.context);
        }

        self.trigger(rule, context, now).await
    }

    fn cooling_down(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        in_cooldown(&self.inner().last_trigger, rule, now)
    }

    async fn trigger(
        &self,
        rule: &AlertRule,
        context: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> EvaluationOutcome {
        let (alert, escalation) = {
            let mut inner = self.inner();
            // Another evaluation may have fired this rule while conditions ran.
            if in_cooldown(&inner.last_trigger, rule, now) {
                return EvaluationOutcome::CoolingDown;
            }
            inner.last_trigger.insert(rule.id.clone(), now);
            if inner.book.has_active_for_rule(&rule.id) {
                tracing::debug!(rule = %rule.name, "alert already active for rule");
                return EvaluationOutcome::Triggered { alert_id: None };
            }

            let alert = build_alert(rule, context, now);
            inner.book.insert(alert.clone());

            let policy = rule
                .escalation_policy
                .as_deref()
                .and_then(|id| inner.policies.get(id))
                .cloned();
            let escalation = match policy {
                Some(policy) if policy.enabled => {
                    let immediate = escalation::schedule_levels(
                        &mut inner.timers,
                        &alert,
                        &policy.id,
                        &policy.levels,
                    );
                    Some((policy.id, immediate))
                }
                Some(_) => None,
                None => {
                    if let Some(policy_id) = &rule.escalation_policy {
                        tracing::warn!(
                            rule = %rule.name,
                            policy = %policy_id,
                            "unknown escalation policy"
                        );
                    }
                    None
                }
            };
            (alert, escalation)
        };

        tracing::info!(
            alert_id = %alert.id,
            rule = %rule.name,
            severity = alert.severity.as_str(),
            "alert triggered"
        );
        self.publish(AlertEvent::Triggered(alert.clone()));

        for action in &rule.actions {
            self.dispatch(&alert.id, action).await;
        }
        if let Some((policy_id, levels)) = escalation {
            for level in levels {
                self.fire_escalation(&alert.id, &policy_id, level).await;
            }
        }
        EvaluationOutcome::Triggered {
            alert_id: Some(alert.id),
        }
    }

    async fn dispatch(&self, alert_id: &str, action: &AlertAction) {
        let Some(alert) = self.get_alert(alert_id) else {
            return;
        };
        let result = self.transports.deliver(&alert, action).await;
        let now = self.now();

        let record = NotificationRecord {
            id: mint_notification_id(),
            kind: action.kind.as_str().to_string(),
            sent_at: now,
            recipient: match &result {
                Ok(delivery) => delivery.recipient.clone(),
                Err(_) => action.recipient(),
            },
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            retry_count: 0,
        };

        {
            let mut inner = self.inner();
            let Some(alert) = inner.book.get_mut(alert_id) else {
                return;
            };
            alert.notifications_sent.push(record.clone());
            if !record.success && action.retry_attempts > 0 {
                inner.timers.schedule(
                    TimerKey::retry(alert_id, &record.id, 1),
                    after_minutes(now, action.retry_delay_minutes),
                    TimerJob::Retry {
                        alert_id: alert_id.to_string(),
                        notification_id: record.id.clone(),
                        action: action.clone(),
                    },
                );
            }
        }

        match result {
            Ok(_) => {
                tracing::debug!(alert_id, channel = action.kind.as_str(), "notification sent");
                self.publish(AlertEvent::NotificationSent {
                    alert_id: alert_id.to_string(),
                    notification: record,
                });
            }
            Err(err) => {
                tracing::warn!(
                    alert_id,
                    channel = action.kind.as_str(),
                    retries = action.retry_attempts,
                    error = %err,
                    "notification failed"
                );
                self.publish(AlertEvent::NotificationFailed {
                    alert_id: alert_id.to_string(),
                    notification: record,
                });
            }
        }
    }

    async fn retry(&self, alert_id: &str, notification_id: &str, action: &AlertAction) {
        let (alert, attempt) = {
            let mut inner = self.inner();
            let Some(alert) = inner.book.get_mut(alert_id) else {
                return;
            };
            let Some(record) = alert.notification_mut(notification_id) else {
                return;
            };
            if record.retry_count >= action.retry_attempts {
                return;
            }
            record.retry_count += 1;
            let attempt = record.retry_count;
            (alert.clone(), attempt)
        };

        tracing::info!(
            alert_id,
            channel = action.kind.as_str(),
            attempt,
            max = action.retry_attempts,
            "retrying notification"
        );
        let result = self.transports.deliver(&alert, action).await;
        let now = self.now();

        match result {
            Ok(delivery) => {
                let record = NotificationRecord {
                    id: mint_notification_id(),
                    kind: action.kind.as_str().to_string(),
                    sent_at: now,
                    recipient: delivery.recipient,
                    success: true,
                    error: None,
                    retry_count: attempt,
                };
                if let Some(alert) = self.inner().book.get_mut(alert_id) {
                    alert.notifications_sent.push(record.clone());
                }
                self.publish(AlertEvent::NotificationSent {
                    alert_id: alert_id.to_string(),
                    notification: record,
                });
            }
            Err(err) => {
                let exhausted = attempt >= action.retry_attempts;
                let failed = {
                    let mut inner = self.inner();
                    let failed = inner
                        .book
                        .get_mut(alert_id)
                        .and_then(|a| a.notification_mut(notification_id))
                        .map(|record| {
                            record.error = Some(err.to_string());
                            record.clone()
                        });
                    if !exhausted {
                        inner.timers.schedule(
                            TimerKey::retry(alert_id, notification_id, attempt + 1),
                            after_minutes(now, action.retry_delay_minutes),
                            TimerJob::Retry {
                                alert_id: alert_id.to_string(),
                                notification_id: notification_id.to_string(),
                                action: action.clone(),
                            },
                        );
                    }
                    failed
                };

                if exhausted {
                    tracing::warn!(alert_id, attempt, error = %err, "giving up on notification");
                } else {
                    tracing::warn!(alert_id, attempt, error = %err, "notification retry failed");
                }
                if let Some(notification) = failed {
                    self.publish(AlertEvent::NotificationFailed {
                        alert_id: alert_id.to_string(),
                        notification,
                    });
                }
            }
        }
    }

    async fn fire_escalation(&self, alert_id: &str, policy_id: &str, level: usize) {
        let (alert, step) = {
            let inner = self.inner();
            let Some(alert) = inner.book.get(alert_id).cloned() else {
                return;
            };
            let Some(step) = inner
                .policies
                .get(policy_id)
                .filter(|p| p.enabled)
                .and_then(|p| p.levels.get(level))
                .cloned()
            else {
                return;
            };
            (alert, step)
        };

        if !escalation::should_fire(&step, &alert) {
            tracing::debug!(
                alert_id,
                policy = policy_id,
                level,
                status = alert.status.as_str(),
                "escalation level skipped"
            );
            return;
        }

        tracing::info!(alert_id, policy = policy_id, level, "escalating alert");
        self.publish(AlertEvent::Escalated {
            alert_id: alert_id.to_string(),
            policy_id: policy_id.to_string(),
            level,
        });
        for action in &step.actions {
            self.dispatch(alert_id, action).await;
        }
    }

    /// Runs every timer that has come due; returns how many ran.
    pub async fn tick(&self) -> usize {
        let now = self.now();
        let due = self.inner().timers.due(now);
        let count = due.len();
        for (_, job) in due {
            match job {
                TimerJob::Retry {
                    alert_id,
                    notification_id,
                    action,
                } => self.retry(&alert_id, &notification_id, &action).await,
                TimerJob::Escalation {
                    alert_id,
                    policy_id,
                    level,
                } => self.fire_escalation(&alert_id, &policy_id, level).await,
            }
        }
        count
    }

    /// Reactivates expired suppressions and writes state; returns how many
    /// alerts came back.
    pub async fn maintain(&self) -> usize {
        let now = self.now();
        let reactivated = self.inner().book.reactivate_due(now);
        for alert in &reactivated {
            tracing::info!(alert_id = %alert.id, "suppression expired, alert active again");
            self.publish(AlertEvent::Reactivated(alert.clone()));
        }
        self.persist().await;
        reactivated.len()
    }

    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let (rules, alerts) = {
            let inner = self.inner();
            (
                inner.rules.values().cloned().collect::<Vec<_>>(),
                inner.book.active_alerts(),
            )
        };
        if let Err(err) = store.save_rules(&rules).await {
            tracing::warn!(error = ?err, "failed to persist alert rules");
        }
        if let Err(err) = store.save_active_alerts(&alerts).await {
            tracing::warn!(error = ?err, "failed to persist active alerts");
        }
    }

    /// Loads persisted rules and alerts; stored rules replace same-id ones.
    pub async fn load_state(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load_rules().await {
            Ok(rules) => {
                let count = rules.len();
                {
                    let mut inner = self.inner();
                    for rule in rules {
                        inner.rules.insert(rule.id.clone(), rule);
                    }
                }
                tracing::info!(rules = count, "loaded alert rules");
            }
            Err(err) => tracing::warn!(error = ?err, "failed to load alert rules"),
        }
        match store.load_active_alerts().await {
            Ok(alerts) => {
                let count = alerts.len();
                self.inner().book.restore(alerts);
                tracing::info!(alerts = count, "loaded active alerts");
            }
            Err(err) => tracing::warn!(error = ?err, "failed to load active alerts"),
        }
    }

    /// Spawns the evaluation, timer and maintenance loops.
    pub fn start(&self) -> AlertEngineHandle {
        let (stop, stop_rx) = watch::channel(false);
        let evaluation = {
            let engine = self.clone();
            spawn_loop("evaluation", self.config.evaluation_interval, stop_rx.clone(), move || {
                let engine = engine.clone();
                async move {
                    engine.evaluate_all().await;
                }
            })
        };
        let timers = {
            let engine = self.clone();
            spawn_loop("timers", self.config.timer_interval, stop_rx.clone(), move || {
                let engine = engine.clone();
                async move {
                    engine.tick().await;
                }
            })
        };
        let maintenance = {
            let engine = self.clone();
            spawn_loop("maintenance", self.config.maintenance_interval, stop_rx, move || {
                let engine = engine.clone();
                async move {
                    engine.maintain().await;
                }
            })
        };

        AlertEngineHandle {
            engine: self.clone(),
            stop,
            tasks: vec![evaluation, timers, maintenance],
        }
    }

    /// Drops pending timers and writes state one last time.
    pub async fn shutdown(&self) {
        let cleared = self.inner().timers.clear();
        tracing::info!(cleared_timers = cleared, "alert engine stopping");
        self.persist().await;
    }
}

fn in_cooldown(
    last_trigger: &HashMap<String, DateTime<Utc>>,
    rule: &AlertRule,
    now: DateTime<Utc>,
) -> bool {
    last_trigger
        .get(&rule.id)
        .is_some_and(|last| now - *last < minutes(rule.cooldown_minutes))
}

fn build_alert(rule: &AlertRule, context: Map<String, Value>, now: DateTime<Utc>) -> Alert {
    let text = |key: &str| context.get(key).and_then(Value::as_str).map(str::to_string);
    let source = AlertSource {
        service: text("service"),
        metric: text("metric"),
    };
    let description = if rule.description.is_empty() {
        format!("Alert condition met for rule {}", rule.name)
    } else {
        rule.description.clone()
    };

    Alert {
        id: mint_alert_id(),
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        severity: rule.severity,
        status: AlertStatus::Active,
        title: rule.name.clone(),
        description,
        source,
        triggered_at: now,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: None,
        resolved_by: None,
        suppressed_until: None,
        notifications_sent: Vec::new(),
        tags: rule.tags.clone(),
        metadata: context,
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_LOOP_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(panic) = AssertUnwindSafe(task()).catch_unwind().await {
                        tracing::error!(
                            loop_name = name,
                            panic = panic_message(&*panic),
                            "alert loop tick panicked"
                        );
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

pub struct AlertEngineHandle {
    engine: AlertEngine,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AlertEngineHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "alert loop ended abnormally");
            }
        }
        self.engine.shutdown().await;
    }
}
