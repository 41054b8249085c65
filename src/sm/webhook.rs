use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sm::events::sm_event;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Body POSTed to the configured failure webhook.
#[derive(Debug, Clone, Serialize)]
pub struct FailurePayload {
    pub service_name: String,
    pub timestamp: DateTime<Utc>,
    pub failure_count: u32,
    pub last_exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub consecutive_errors: u32,
}

/// Stateless webhook client. A `Notifier` without a URL is a no-op.
pub struct Notifier {
    url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(url: Option<String>) -> Self {
        let url = url.filter(|u| !u.trim().is_empty());
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .user_agent(concat!("servicemaster/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { url, client }
    }

    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send a failure notification. Success iff the endpoint answers 2xx.
    pub async fn notify_failure(&self, payload: FailurePayload) -> anyhow::Result<()> {
        let Some(url) = self.url.as_deref() else {
            return Ok(());
        };

        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("failed to send webhook: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned non-2xx status: {status}");
        }
        sm_event(
            "webhook",
            Some(&payload.service_name),
            format!("outcome=sent consecutive_failures={}", payload.consecutive_errors),
        );
        Ok(())
    }
}
