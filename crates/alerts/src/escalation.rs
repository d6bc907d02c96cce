use chrono::{DateTime, Utc};
use vigil_core::model::alert::{Alert, AlertStatus};
use vigil_core::model::rule::EscalationLevel;
use vigil_core::time::after_minutes;

use crate::scheduler::{TimerJob, TimerKey, TimerQueue};

/// Queues every delayed level of `policy_id` for the alert and returns the
/// indexes of zero-delay levels, which the caller fires right away.
pub fn schedule_levels(
    timers: &mut TimerQueue,
    alert: &Alert,
    policy_id: &str,
    levels: &[EscalationLevel],
) -> Vec<usize> {
    let mut immediate = Vec::new();
    for (index, level) in levels.iter().enumerate() {
        if level.delay_minutes == 0 {
            immediate.push(index);
            continue;
        }
        timers.schedule(
            TimerKey::escalation(&alert.id, policy_id, index),
            due_at(alert.triggered_at, level),
            TimerJob::Escalation {
                alert_id: alert.id.clone(),
                policy_id: policy_id.to_string(),
                level: index,
            },
        );
    }
    immediate
}

pub fn due_at(triggered_at: DateTime<Utc>, level: &EscalationLevel) -> DateTime<Utc> {
    after_minutes(triggered_at, level.delay_minutes)
}

/// Whether the level should notify given the alert's state right now.
pub fn should_fire(level: &EscalationLevel, alert: &Alert) -> bool {
    alert.status != AlertStatus::Suppressed && level.condition.holds(alert)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::Map;
    use testkit::{base_time, tiered_policy};
    use vigil_core::model::alert::{Alert, AlertSource, AlertStatus, Severity};
    use vigil_core::model::rule::EscalationCondition;

    use super::*;

    fn alert(status: AlertStatus) -> Alert {
        Alert {
            id: "alert_1".into(),
            rule_id: "service-down".into(),
            rule_name: "Service Down".into(),
            severity: Severity::Warning,
            status,
            title: "Service Down".into(),
            description: String::new(),
            source: AlertSource::default(),
            triggered_at: base_time(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            suppressed_until: None,
            notifications_sent: Vec::new(),
            tags: Vec::new(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn zero_delay_levels_fire_inline() {
        let policy = tiered_policy("standard", &[0, 15, 30], EscalationCondition::NotAcknowledged);
        let mut timers = TimerQueue::new();
        let alert = alert(AlertStatus::Active);
        let immediate = schedule_levels(&mut timers, &alert, &policy.id, &policy.levels);

        assert_eq!(immediate, vec![0]);
        assert_eq!(timers.pending(), 2);
        assert_eq!(timers.next_due(), Some(base_time() + Duration::minutes(15)));
    }

    #[test]
    fn conditions_gate_on_current_state() {
        let level = |condition| tiered_policy("p", &[5], condition).levels.remove(0);

        let mut acked = alert(AlertStatus::Acknowledged);
        acked.acknowledged_at = Some(base_time());
        assert!(!should_fire(&level(EscalationCondition::NotAcknowledged), &acked));
        assert!(should_fire(&level(EscalationCondition::NotResolved), &acked));
        assert!(!should_fire(&level(EscalationCondition::SeverityCritical), &acked));
        assert!(should_fire(&level(EscalationCondition::None), &acked));

        let suppressed = alert(AlertStatus::Suppressed);
        assert!(!should_fire(&level(EscalationCondition::None), &suppressed));
    }
}
