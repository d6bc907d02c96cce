//! Timer queue for notification retries and escalation levels.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use vigil_core::model::rule::AlertAction;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub alert_id: String,
    pub action_id: String,
    pub attempt: u32,
}

impl TimerKey {
    pub fn retry(alert_id: &str, notification_id: &str, attempt: u32) -> Self {
        Self {
            alert_id: alert_id.to_string(),
            action_id: notification_id.to_string(),
            attempt,
        }
    }

    pub fn escalation(alert_id: &str, policy_id: &str, level: usize) -> Self {
        Self {
            alert_id: alert_id.to_string(),
            action_id: format!("escalation:{policy_id}:{level}"),
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerJob {
    Retry {
        alert_id: String,
        notification_id: String,
        action: AlertAction,
    },
    Escalation {
        alert_id: String,
        policy_id: String,
        level: usize,
    },
}

impl TimerJob {
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalation { .. })
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    // (due, seq) keeps insertion order among timers sharing a due time.
    by_due: BTreeMap<(DateTime<Utc>, u64), (TimerKey, TimerJob)>,
    index: HashMap<TimerKey, (DateTime<Utc>, u64)>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `job` at `due`, replacing any timer with the same key.
    pub fn schedule(&mut self, key: TimerKey, due: DateTime<Utc>, job: TimerJob) {
        self.cancel(&key);
        self.seq += 1;
        let slot = (due, self.seq);
        self.index.insert(key.clone(), slot);
        self.by_due.insert(slot, (key, job));
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.index.remove(key) {
            Some(slot) => self.by_due.remove(&slot).is_some(),
            None => false,
        }
    }

    /// Drops every timer for the alert; returns how many were pending.
    #[cfg(test)]
    pub fn cancel_alert(&mut self, alert_id: &str) -> usize {
        self.cancel_where(|key, _| key.alert_id == alert_id)
    }

    pub fn cancel_escalations(&mut self, alert_id: &str) -> usize {
        self.cancel_where(|key, job| key.alert_id == alert_id && job.is_escalation())
    }

    fn cancel_where(&mut self, pred: impl Fn(&TimerKey, &TimerJob) -> bool) -> usize {
        let doomed: Vec<TimerKey> = self
            .by_due
            .values()
            .filter(|(key, job)| pred(key, job))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.cancel(key);
        }
        doomed.len()
    }

    /// Removes and returns every timer due at or before `now`, earliest first.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<(TimerKey, TimerJob)> {
        let mut out = Vec::new();
        while let Some(entry) = self.by_due.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let (key, job) = entry.remove();
            self.index.remove(&key);
            out.push((key, job));
        }
        out
    }

    #[cfg(test)]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.by_due.keys().next().map(|(due, _)| *due)
    }

    pub fn pending(&self) -> usize {
        self.by_due.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.by_due.len();
        self.by_due.clear();
        self.index.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use testkit::{base_time, email_action};

    use super::*;

    fn escalation(alert_id: &str, level: usize) -> (TimerKey, TimerJob) {
        (
            TimerKey::escalation(alert_id, "standard", level),
            TimerJob::Escalation {
                alert_id: alert_id.to_string(),
                policy_id: "standard".to_string(),
                level,
            },
        )
    }

    #[test]
    fn due_pops_in_time_order() {
        let t0 = base_time();
        let mut queue = TimerQueue::new();
        for (level, minutes) in [(2, 30), (0, 0), (1, 15)] {
            let (key, job) = escalation("a1", level);
            queue.schedule(key, t0 + Duration::minutes(minutes), job);
        }
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.next_due(), Some(t0));

        let first = queue.due(t0 + Duration::minutes(15));
        let levels: Vec<u32> = first
            .iter()
            .map(|(key, _)| key.action_id.rsplit(':').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(levels, vec![0, 1]);
        assert_eq!(queue.pending(), 1);
        assert!(queue.due(t0 + Duration::minutes(20)).is_empty());
    }

    #[test]
    fn same_key_replaces_and_cancel_by_alert() {
        let t0 = base_time();
        let mut queue = TimerQueue::new();
        let key = TimerKey::retry("a1", "n1", 1);
        let job = TimerJob::Retry {
            alert_id: "a1".into(),
            notification_id: "n1".into(),
            action: email_action("ops@example.com", 3, 1),
        };
        queue.schedule(key.clone(), t0, job.clone());
        queue.schedule(key.clone(), t0 + Duration::minutes(1), job);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.next_due(), Some(t0 + Duration::minutes(1)));

        let (esc_key, esc_job) = escalation("a1", 0);
        queue.schedule(esc_key, t0, esc_job);
        let (other_key, other_job) = escalation("a2", 0);
        queue.schedule(other_key, t0, other_job);

        assert_eq!(queue.cancel_escalations("a1"), 1);
        assert_eq!(queue.cancel_alert("a1"), 1);
        assert!(!queue.cancel(&key));
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.clear(), 1);
        assert_eq!(queue.pending(), 0);
    }
}
