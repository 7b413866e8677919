use crate::error::{NotifyError, Result};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::NotificationChannel;
use alarmd_common::types::{AlarmStrategy, Alert};
use async_trait::async_trait;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

/// Posts alerts as JSON to a fixed URL.
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
    body_template: Option<String>,
    backoff: Duration,
}

impl WebhookChannel {
    pub fn new(
        name: &str,
        url: &str,
        body_template: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(NotifyError::InvalidConfig(format!(
                "webhook '{name}' has an empty url"
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
            body_template,
            backoff: Duration::from_millis(100),
        })
    }

    /// Base delay between attempts; doubles after each failure.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn render_body(&self, alert: &Alert, strategy: &AlarmStrategy) -> Result<String> {
        if let Some(template) = &self.body_template {
            let team = alert
                .team
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(",");
            return Ok(template
                .replace("{{alert_id}}", &alert.alert_id)
                .replace("{{title}}", &alert.title)
                .replace("{{content}}", &alert.content)
                .replace("{{level}}", &alert.level.to_string())
                .replace("{{status}}", alert.status.as_str())
                .replace("{{fingerprint}}", &alert.fingerprint)
                .replace("{{event_count}}", &alert.event_count.to_string())
                .replace("{{group_by}}", &alert.group_by_field)
                .replace("{{first_event_time}}", &alert.first_event_time.to_rfc3339())
                .replace("{{last_event_time}}", &alert.last_event_time.to_rfc3339())
                .replace("{{rule_id}}", &strategy.id.to_string())
                .replace("{{rule_name}}", &strategy.name)
                .replace("{{team}}", &team));
        }
        Ok(serde_json::to_string(&serde_json::json!({
            "alert_id": alert.alert_id,
            "fingerprint": alert.fingerprint,
            "rule_id": strategy.id,
            "rule_name": strategy.name,
            "title": alert.title,
            "content": alert.content,
            "level": alert.level,
            "status": alert.status,
            "event_count": alert.event_count,
            "group_by": alert.group_by_field,
            "first_event_time": alert.first_event_time.to_rfc3339(),
            "last_event_time": alert.last_event_time.to_rfc3339(),
            "is_session_alert": alert.is_session_alert,
            "session_status": alert.session_status,
            "team": alert.team,
        }))?)
    }

    async fn post(&self, body: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url.as_str())
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = match resp.text().await {
            Ok(text) => truncate_string(&text, MAX_BODY_LENGTH),
            Err(e) => format!("[Failed to read response body: {e}]"),
        };
        Err(NotifyError::ApiError {
            service: self.name.clone(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, alert: &Alert, strategy: &AlarmStrategy) -> anyhow::Result<()> {
        let body = self.render_body(alert, strategy)?;

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.post(&body).await {
                Ok(()) => {
                    tracing::debug!(
                        channel = %self.name,
                        alert_id = %alert.alert_id,
                        attempt = attempt + 1,
                        "Webhook delivered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %self.name,
                        attempt = attempt + 1,
                        error = %e,
                        "Webhook send failed, retrying"
                    );
                    last_err = Some(e);
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(self.backoff * 2u32.pow(attempt)).await;
            }
        }

        match last_err {
            Some(e) => {
                tracing::error!(
                    channel = %self.name,
                    url = %self.url,
                    error = %e,
                    attempts = MAX_ATTEMPTS,
                    "Webhook failed after retries"
                );
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    fn channel_name(&self) -> &str {
        &self.name
    }
}
