//! Notification transports and the registry that picks one per action.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use vigil_core::error::{Result, VigilError};
use vigil_core::model::alert::Alert;
use vigil_core::model::rule::{ActionKind, AlertAction};
use vigil_core::provider::{Delivery, NotificationTransport};

#[derive(Default, Clone)]
pub struct TransportRegistry {
    by_kind: HashMap<ActionKind, Arc<dyn NotificationTransport>>,
    custom: HashMap<String, Arc<dyn NotificationTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Webhooks over HTTP; every other channel is written to the log.
    pub fn with_defaults(webhook_timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(
            ActionKind::Webhook,
            Arc::new(WebhookTransport::new(webhook_timeout)?),
        );
        let log: Arc<dyn NotificationTransport> = Arc::new(LogTransport);
        for kind in [
            ActionKind::Email,
            ActionKind::Chat,
            ActionKind::Sms,
            ActionKind::Pager,
        ] {
            registry.register(kind, log.clone());
        }
        Ok(registry)
    }

    pub fn register(&mut self, kind: ActionKind, transport: Arc<dyn NotificationTransport>) {
        self.by_kind.insert(kind, transport);
    }

    /// Transport for `custom` actions whose `handler` names it.
    pub fn register_custom(
        &mut self,
        handler: impl Into<String>,
        transport: Arc<dyn NotificationTransport>,
    ) {
        self.custom.insert(handler.into(), transport);
    }

    pub fn resolve(&self, action: &AlertAction) -> Option<Arc<dyn NotificationTransport>> {
        match action.kind {
            ActionKind::Custom => action
                .config
                .handler
                .as_deref()
                .and_then(|h| self.custom.get(h))
                .cloned(),
            kind => self.by_kind.get(&kind).cloned(),
        }
    }

    pub async fn deliver(&self, alert: &Alert, action: &AlertAction) -> Result<Delivery> {
        let Some(transport) = self.resolve(action) else {
            return Err(VigilError::Delivery(format!(
                "no transport registered for {}",
                action.kind.as_str()
            )));
        };
        transport.deliver(alert, action).await
    }
}

/// POSTs the alert as JSON; any non-2xx answer is a failed delivery.
pub struct WebhookTransport {
    client: Client,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VigilError::Config(format!("webhook client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    async fn deliver(&self, alert: &Alert, action: &AlertAction) -> Result<Delivery> {
        let url = action
            .config
            .url
            .as_deref()
            .ok_or_else(|| VigilError::Delivery("webhook action has no url".to_string()))?;

        let body = json!({
            "alert": alert,
            "message": action.config.message,
        });
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VigilError::Delivery(format!("webhook request to {url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(VigilError::Delivery(format!("webhook {url} returned {status}")));
        }
        Ok(Delivery {
            recipient: url.to_string(),
        })
    }
}

/// Records the notification through `tracing` instead of sending it anywhere.
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn deliver(&self, alert: &Alert, action: &AlertAction) -> Result<Delivery> {
        let recipient = action.recipient();
        tracing::info!(
            alert_id = %alert.id,
            channel = action.kind.as_str(),
            recipient = %recipient,
            severity = alert.severity.as_str(),
            title = %alert.title,
            "notification delivered"
        );
        Ok(Delivery { recipient })
    }
}
