//! Rules and escalation policy installed on a fresh engine.

use chrono::{DateTime, Utc};
use vigil_core::model::alert::Severity;
use vigil_core::model::rule::{
    ActionConfig, ActionKind, AlertAction, AlertCondition, AlertRule, ConditionConfig,
    ConditionKind, EscalationCondition, EscalationLevel, EscalationPolicy, Operator,
};

pub const STANDARD_ESCALATION: &str = "standard-escalation";

fn action(
    kind: ActionKind,
    config: ActionConfig,
    retry_attempts: u32,
    retry_delay_minutes: u64,
) -> AlertAction {
    AlertAction {
        kind,
        config,
        retry_attempts,
        retry_delay_minutes,
    }
}

fn email(to: &str, retry_attempts: u32, retry_delay_minutes: u64) -> AlertAction {
    action(
        ActionKind::Email,
        ActionConfig {
            recipients: vec![to.to_string()],
            ..ActionConfig::default()
        },
        retry_attempts,
        retry_delay_minutes,
    )
}

fn webhook(url: &str, retry_attempts: u32, retry_delay_minutes: u64) -> AlertAction {
    action(
        ActionKind::Webhook,
        ActionConfig {
            url: Some(url.to_string()),
            ..ActionConfig::default()
        },
        retry_attempts,
        retry_delay_minutes,
    )
}

fn condition(kind: ConditionKind, config: ConditionConfig) -> AlertCondition {
    AlertCondition { kind, config }
}

fn threshold(metric: &str, operator: Operator, value: f64, window_secs: u64) -> ConditionConfig {
    ConditionConfig {
        metric: Some(metric.to_string()),
        operator: Some(operator),
        threshold: Some(value),
        window_secs: Some(window_secs),
        ..ConditionConfig::default()
    }
}

struct RuleSpec<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    severity: Severity,
    conditions: Vec<AlertCondition>,
    actions: Vec<AlertAction>,
    cooldown_minutes: u64,
    tags: &'a [&'a str],
    escalation_policy: Option<&'a str>,
}

impl RuleSpec<'_> {
    fn build(self, now: DateTime<Utc>) -> AlertRule {
        AlertRule {
            id: self.id.to_string(),
            name: self.name.to_string(),
            description: self.description.to_string(),
            severity: self.severity,
            enabled: true,
            conditions: self.conditions,
            actions: self.actions,
            cooldown_minutes: self.cooldown_minutes,
            tags: self.tags.iter().map(|t| t.to_string()).collect(),
            escalation_policy: self.escalation_policy.map(str::to_string),
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn default_rules(now: DateTime<Utc>) -> Vec<AlertRule> {
    vec![
        RuleSpec {
            id: "high-cpu-usage",
            name: "High CPU Usage",
            description: "CPU usage above 80% over five minutes",
            severity: Severity::Warning,
            conditions: vec![condition(
                ConditionKind::MetricThreshold,
                threshold("system.cpu.usage", Operator::Gt, 80.0, 300),
            )],
            actions: vec![email("admin@example.com", 3, 5)],
            cooldown_minutes: 15,
            tags: &["system", "performance"],
            escalation_policy: None,
        }
        .build(now),
        RuleSpec {
            id: "high-memory-usage",
            name: "High Memory Usage",
            description: "Memory usage above 90%",
            severity: Severity::Critical,
            conditions: vec![condition(
                ConditionKind::MetricThreshold,
                threshold("system.memory.usage", Operator::Gt, 90.0, 60),
            )],
            actions: vec![webhook("http://localhost:3000/webhooks/alerts", 5, 2)],
            cooldown_minutes: 10,
            tags: &["system", "memory"],
            escalation_policy: None,
        }
        .build(now),
        RuleSpec {
            id: "service-down",
            name: "Service Down",
            description: "A monitored service reports unhealthy",
            severity: Severity::Critical,
            conditions: vec![condition(
                ConditionKind::HealthStatus,
                ConditionConfig {
                    service: Some("any".to_string()),
                    threshold: Some(0.0),
                    ..ConditionConfig::default()
                },
            )],
            actions: vec![
                email("oncall@example.com", 3, 1),
                action(
                    ActionKind::Chat,
                    ActionConfig {
                        channel: Some("#alerts".to_string()),
                        ..ActionConfig::default()
                    },
                    2,
                    1,
                ),
            ],
            cooldown_minutes: 5,
            tags: &["availability", "critical"],
            escalation_policy: Some(STANDARD_ESCALATION),
        }
        .build(now),
        RuleSpec {
            id: "error-rate-spike",
            name: "Error Rate Spike",
            description: "Application error rate more than tripled against the previous window",
            severity: Severity::Warning,
            conditions: vec![condition(
                ConditionKind::RateChange,
                threshold("application.errors.rate", Operator::Gt, 200.0, 300),
            )],
            actions: vec![webhook("http://localhost:3000/webhooks/error-alerts", 3, 2)],
            cooldown_minutes: 20,
            tags: &["application", "errors"],
            escalation_policy: None,
        }
        .build(now),
    ]
}

pub fn default_policies() -> Vec<EscalationPolicy> {
    let sms = action(
        ActionKind::Sms,
        ActionConfig {
            recipients: vec!["+1234567890".to_string()],
            ..ActionConfig::default()
        },
        3,
        2,
    );
    vec![EscalationPolicy {
        id: STANDARD_ESCALATION.to_string(),
        name: "Standard Escalation".to_string(),
        enabled: true,
        levels: vec![
            EscalationLevel {
                delay_minutes: 0,
                actions: vec![email("oncall@example.com", 2, 1)],
                condition: EscalationCondition::None,
            },
            EscalationLevel {
                delay_minutes: 15,
                actions: vec![sms],
                condition: EscalationCondition::NotAcknowledged,
            },
            EscalationLevel {
                delay_minutes: 30,
                actions: vec![email("manager@example.com", 2, 1)],
                condition: EscalationCondition::NotAcknowledged,
            },
        ],
    }]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use testkit::base_time;

    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let rules = default_rules(base_time());
        let ids: HashSet<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        assert!(rules.iter().all(|r| r.enabled && !r.actions.is_empty()));

        let policies = default_policies();
        let delays: Vec<u64> = policies[0].levels.iter().map(|l| l.delay_minutes).collect();
        assert_eq!(delays, vec![0, 15, 30]);
        for rule in &rules {
            if let Some(policy) = &rule.escalation_policy {
                assert!(policies.iter().any(|p| &p.id == policy));
            }
        }
    }
}
