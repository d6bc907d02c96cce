use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::alert::{Alert, AlertStatus, Severity};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    MetricThreshold,
    LogPattern,
    HealthStatus,
    RateChange,
    Custom,
}

impl ConditionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetricThreshold => "metric_threshold",
            Self::LogPattern => "log_pattern",
            Self::HealthStatus => "health_status",
            Self::RateChange => "rate_change",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Operator {
    #[default]
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Eq => "=",
            Self::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConditionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Observation window handed to the signal source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Name of a predicate registered with the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub config: ConditionConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Email,
    Webhook,
    #[serde(alias = "slack")]
    Chat,
    Sms,
    #[serde(alias = "pagerduty")]
    Pager,
    Custom,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Chat => "chat",
            Self::Sms => "sms",
            Self::Pager => "pager",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Name of a custom transport registered with the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub config: ActionConfig,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_delay_minutes: u64,
}

impl AlertAction {
    /// Best-effort recipient label for notification records.
    pub fn recipient(&self) -> String {
        if !self.config.recipients.is_empty() {
            return self.config.recipients.join(", ");
        }
        self.config
            .url
            .clone()
            .or_else(|| self.config.channel.clone())
            .or_else(|| self.config.handler.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub enabled: bool,
    pub conditions: Vec<AlertCondition>,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    pub cooldown_minutes: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_policy: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by `update_rule`; `None` leaves a field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub enabled: Option<bool>,
    pub conditions: Option<Vec<AlertCondition>>,
    pub actions: Option<Vec<AlertAction>>,
    pub cooldown_minutes: Option<u64>,
    pub tags: Option<Vec<String>>,
    pub escalation_policy: Option<Option<String>>,
}

impl RuleUpdate {
    pub fn apply(self, rule: &mut AlertRule, now: DateTime<Utc>) {
        if let Some(v) = self.name {
            rule.name = v;
        }
        if let Some(v) = self.description {
            rule.description = v;
        }
        if let Some(v) = self.severity {
            rule.severity = v;
        }
        if let Some(v) = self.enabled {
            rule.enabled = v;
        }
        if let Some(v) = self.conditions {
            rule.conditions = v;
        }
        if let Some(v) = self.actions {
            rule.actions = v;
        }
        if let Some(v) = self.cooldown_minutes {
            rule.cooldown_minutes = v;
        }
        if let Some(v) = self.tags {
            rule.tags = v;
        }
        if let Some(v) = self.escalation_policy {
            rule.escalation_policy = v;
        }
        rule.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCondition {
    NotAcknowledged,
    NotResolved,
    SeverityCritical,
    #[default]
    None,
}

impl EscalationCondition {
    /// Gate checked when the level's timer fires.
    pub fn holds(self, alert: &Alert) -> bool {
        match self {
            Self::NotAcknowledged => {
                alert.acknowledged_at.is_none() && alert.status != AlertStatus::Resolved
            }
            Self::NotResolved => alert.status != AlertStatus::Resolved,
            Self::SeverityCritical => alert.severity == Severity::Critical,
            Self::None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationLevel {
    pub delay_minutes: u64,
    pub actions: Vec<AlertAction>,
    #[serde(default)]
    pub condition: EscalationCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationPolicy {
    pub id: String,
    pub name: String,
    pub levels: Vec<EscalationLevel>,
    pub enabled: bool,
}
