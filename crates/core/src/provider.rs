//! Interfaces the engines consume from outside collaborators: condition
//! signal producers and notification transports.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::alert::Alert;
use crate::model::rule::AlertAction;

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Current reading, aggregated over `window` when one is given.
    async fn snapshot(
        &self,
        metric: &str,
        service: Option<&str>,
        window: Option<Duration>,
    ) -> Option<f64>;

    /// Reading over the window immediately preceding the current one.
    async fn baseline(&self, metric: &str, service: Option<&str>, window: Duration)
    -> Option<f64>;
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn recent(&self, service: Option<&str>, window: Option<Duration>) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    pub service: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn statuses(&self) -> Vec<ServiceHealth>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: String,
}

/// One implementation per channel type (email, webhook, chat, ...).
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, alert: &Alert, action: &AlertAction) -> Result<Delivery>;
}
