use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::types::SystemEvent;

/// Outbound system events. Delivery is best-effort: implementations log
/// failures and never return them to the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn system_broadcast(&self, event: SystemEvent);
}

/// Writes events to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn system_broadcast(&self, event: SystemEvent) {
        info!(?event, "system event");
    }
}

/// POSTs each event as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn system_broadcast(&self, event: SystemEvent) {
        let result = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&event)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), url = %self.url, "notify webhook rejected event"),
            Err(error) => warn!(%error, url = %self.url, "notify webhook unreachable"),
        }
    }
}
