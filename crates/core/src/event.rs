use serde::{Deserialize, Serialize};

use crate::model::alert::{Alert, NotificationRecord};
use crate::model::span::Span;
use crate::model::trace::TraceSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TraceEvent {
    SpanStarted(Span),
    SpanFinished(Span),
    TraceCompleted(TraceSummary),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AlertEvent {
    Triggered(Alert),
    Acknowledged(Alert),
    Resolved(Alert),
    Suppressed(Alert),
    Reactivated(Alert),
    NotificationSent {
        alert_id: String,
        notification: NotificationRecord,
    },
    NotificationFailed {
        alert_id: String,
        notification: NotificationRecord,
    },
    Escalated {
        alert_id: String,
        policy_id: String,
        level: usize,
    },
}
