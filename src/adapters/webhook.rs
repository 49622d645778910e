//! Chat webhook alert delivery
//!
//! Posts alert text as `{"content": ...}` to an incoming-webhook URL.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{PilotError, Result};
use crate::supervisor::{Alert, AlertSink};

/// Webhook notification client
#[derive(Clone)]
pub struct WebhookAlertSink {
    client: Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

impl WebhookAlertSink {
    /// Create a new webhook sink with explicit URL
    pub fn new(webhook_url: String) -> Arc<Self> {
        info!("Webhook alert delivery enabled");
        Arc::new(Self {
            client: Client::new(),
            webhook_url,
        })
    }

    /// Send a text message to the webhook
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let message = WebhookMessage { content: text };

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                error!("Webhook request failed: {}", e);
                PilotError::Transport(e.to_string())
            })?;

        if resp.status().is_success() {
            debug!("Webhook notification sent successfully");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(PilotError::Transport(format!("HTTP {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        self.send_message(&alert.format_text()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_body() {
        let body = serde_json::to_value(WebhookMessage { content: "hello" }).unwrap();
        assert_eq!(body, serde_json::json!({"content": "hello"}));
    }
}
