use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use vigil_core::model::alert::{Alert, AlertStatus, Severity};
use vigil_core::query::AlertStatistics;

/// Live alerts keyed by id plus a bounded ring of resolved ones.
#[derive(Debug)]
pub struct AlertBook {
    active: HashMap<String, Alert>,
    history: VecDeque<Alert>,
    max_history: usize,
}

impl AlertBook {
    pub fn new(max_history: usize) -> Self {
        Self {
            active: HashMap::new(),
            history: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    /// True while an alert for the rule is still in the `active` state.
    pub fn has_active_for_rule(&self, rule_id: &str) -> bool {
        self.active
            .values()
            .any(|a| a.rule_id == rule_id && a.status == AlertStatus::Active)
    }

    pub fn insert(&mut self, alert: Alert) {
        self.active.insert(alert.id.clone(), alert);
    }

    /// Replaces the live set with alerts loaded from disk; resolved ones go to history.
    pub fn restore(&mut self, alerts: Vec<Alert>) {
        for alert in alerts {
            if alert.status.is_terminal() {
                self.push_history(alert);
            } else {
                self.insert(alert);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.active
            .get(id)
            .or_else(|| self.history.iter().rev().find(|a| a.id == id))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Alert> {
        if self.active.contains_key(id) {
            return self.active.get_mut(id);
        }
        self.history.iter_mut().rev().find(|a| a.id == id)
    }

    pub fn acknowledge(&mut self, id: &str, by: &str, now: DateTime<Utc>) -> Option<Alert> {
        let alert = self.active.get_mut(id)?;
        if alert.status != AlertStatus::Active {
            return None;
        }
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
        alert.acknowledged_by = Some(by.to_string());
        Some(alert.clone())
    }

    pub fn resolve(&mut self, id: &str, by: &str, now: DateTime<Utc>) -> Option<Alert> {
        let mut alert = self.active.remove(id)?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.resolved_by = Some(by.to_string());
        alert.suppressed_until = None;
        self.push_history(alert.clone());
        Some(alert)
    }

    pub fn suppress(&mut self, id: &str, until: DateTime<Utc>) -> Option<Alert> {
        let alert = self.active.get_mut(id)?;
        if alert.status != AlertStatus::Active {
            return None;
        }
        alert.status = AlertStatus::Suppressed;
        alert.suppressed_until = Some(until);
        Some(alert.clone())
    }

    /// Flips suppressed alerts whose window has passed back to active.
    pub fn reactivate_due(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut out = Vec::new();
        for alert in self.active.values_mut() {
            if alert.status == AlertStatus::Suppressed
                && alert.suppressed_until.is_some_and(|until| until <= now)
            {
                alert.status = AlertStatus::Active;
                alert.suppressed_until = None;
                out.push(alert.clone());
            }
        }
        out
    }

    /// Non-resolved alerts, newest first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.values().cloned().collect();
        alerts.sort_by(|a, b| {
            b.triggered_at
                .cmp(&a.triggered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        alerts
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn statistics(&self) -> AlertStatistics {
        let mut stats = AlertStatistics {
            by_severity: [Severity::Info, Severity::Warning, Severity::Critical]
                .into_iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect(),
            by_service: BTreeMap::new(),
            ..AlertStatistics::default()
        };

        let mut resolution_total = 0i64;
        let mut resolution_count = 0usize;
        for alert in self.active.values().chain(self.history.iter()) {
            stats.total += 1;
            match alert.status {
                AlertStatus::Active => stats.active += 1,
                AlertStatus::Acknowledged => stats.acknowledged += 1,
                AlertStatus::Resolved => stats.resolved += 1,
                AlertStatus::Suppressed => stats.suppressed += 1,
            }
            *stats
                .by_severity
                .entry(alert.severity.as_str().to_string())
                .or_default() += 1;
            let service = alert.source.service.as_deref().unwrap_or("unknown");
            *stats.by_service.entry(service.to_string()).or_default() += 1;

            if let Some(resolved_at) = alert.resolved_at {
                resolution_total += (resolved_at - alert.triggered_at).num_milliseconds();
                resolution_count += 1;
            }
        }

        if resolution_count > 0 {
            stats.average_resolution_ms = resolution_total as f64 / resolution_count as f64;
        }
        stats
    }

    fn push_history(&mut self, alert: Alert) {
        self.history.push_back(alert);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}
