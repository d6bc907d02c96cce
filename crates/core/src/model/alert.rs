use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "critical" | "crit" => Ok(Self::Critical),
            _ => Err(VigilError::Parse(format!("unknown severity: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Suppressed => "suppressed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AlertSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sent_at: DateTime<Utc>,
    pub recipient: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub title: String,
    pub description: String,
    pub source: AlertSource,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub suppressed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notifications_sent: Vec<NotificationRecord>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Alert {
    pub fn notification_mut(&mut self, id: &str) -> Option<&mut NotificationRecord> {
        self.notifications_sent.iter_mut().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parse() {
        assert_eq!(Severity::from_str("WARN").unwrap(), Severity::Warning);
        assert_eq!(Severity::from_str("critical").unwrap(), Severity::Critical);
        assert!(Severity::from_str("loud").is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&AlertStatus::Acknowledged).unwrap();
        assert_eq!(s, "\"acknowledged\"");
        assert!(AlertStatus::Resolved.is_terminal());
        assert!(!AlertStatus::Suppressed.is_terminal());
    }
}
