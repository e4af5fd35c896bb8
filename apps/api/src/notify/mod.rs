//! Best-effort progress notifications to the dashboard webhook.
//!
//! Failures are logged and swallowed; a run never fails because the
//! dashboard is unreachable. Without a configured URL this is a no-op.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT_SECS: u64 = 5;
const AGENT_NAME: &str = "Orchestrator";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub run_id: String,
    pub agent: String,
    pub status: String,
    pub message: String,
    pub step: Option<String>,
    pub timestamp: i64,
}

impl ProgressEvent {
    pub fn new(run_id: &str, status: &str, message: impl Into<String>, step: Option<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            agent: AGENT_NAME.to_string(),
            status: status.to_string(),
            message: message.into(),
            step,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    client: Option<Client>,
    url: Option<String>,
    secret: Option<String>,
}

impl ProgressReporter {
    pub fn new(url: Option<String>, secret: Option<String>) -> Self {
        let client = url.as_ref().and_then(|_| {
            Client::builder()
                .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
                .build()
                .map_err(|e| warn!("Webhook client unavailable, notifications disabled: {e}"))
                .ok()
        });
        Self {
            client,
            url,
            secret,
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: None,
            url: None,
            secret: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some() && self.url.is_some()
    }

    pub async fn report(&self, event: ProgressEvent) {
        let (Some(client), Some(url)) = (&self.client, &self.url) else {
            return;
        };

        let mut request = client
            .post(url)
            .header("user-agent", concat!("adgen/", env!("CARGO_PKG_VERSION")))
            .json(&event);
        if let Some(secret) = &self.secret {
            request = request.header("x-webhook-secret", secret);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Webhook delivered: {} {}", event.run_id, event.status);
            }
            Ok(resp) => {
                warn!(
                    "Webhook returned {} for {} {}",
                    resp.status(),
                    event.run_id,
                    event.status
                );
            }
            Err(e) => {
                warn!("Webhook delivery failed for {} {}: {e}", event.run_id, event.status);
            }
        }
    }
}
