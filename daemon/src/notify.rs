//! Optional webhook notification sink for operator alerts.
//!
//! Delivery is fire-and-forget: a failed webhook is logged and counted, never
//! surfaced to the code path that raised the alert. The durable record of the
//! alert is the outbox event, not this sink.

use chrono::Utc;
use event_schema::AlertSeverity;
use tracing::{debug, warn};

use crate::config::NotificationConfig;

pub struct Notifier {
    client: reqwest::Client,
    config: Option<NotificationConfig>,
}

impl Notifier {
    pub fn new(config: Option<NotificationConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.is_some()
    }

    pub async fn alert(&self, severity: AlertSeverity, summary: &str, data: serde_json::Value) {
        let Some(config) = &self.config else {
            return;
        };

        let body = serde_json::json!({
            "severity": severity.as_str(),
            "summary": summary,
            "data": data,
            "source": "stratavored",
            "timestamp": Utc::now(),
        });

        let mut request = self.client.post(&config.webhook_url).json(&body);
        if let Some(token) = &config.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(severity = severity.as_str(), summary, "alert delivered");
            }
            Ok(response) => {
                warn!(
                    status = %response.status(),
                    summary,
                    "alert webhook rejected"
                );
            }
            Err(e) => {
                warn!(error = %e, summary, "alert webhook unreachable");
            }
        }
    }
}
