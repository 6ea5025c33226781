//! Alerts and the sinks that deliver them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{AppError, Result};

/// Retry delays for webhook delivery
const RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    High,
    Warning,
    Info,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Info => "info",
        }
    }

    /// Attachment colour used by chat webhooks
    pub fn color(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "#d00000",
            AlertSeverity::High => "#ff6d00",
            AlertSeverity::Warning => "#ffd600",
            AlertSeverity::Info => "#2962ff",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, alert_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            alert_type: alert_type.into(),
            message: message.into(),
            details: json!({}),
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// `{ text, attachments: [{ color, fields: [{title, value}], timestamp }] }`
    pub fn webhook_payload(&self) -> Value {
        let mut fields = vec![
            json!({"title": "Severity", "value": self.severity.as_str()}),
            json!({"title": "Type", "value": self.alert_type}),
        ];
        if let Value::Object(details) = &self.details {
            for (title, value) in details {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                fields.push(json!({"title": title, "value": value}));
            }
        }

        json!({
            "text": format!("[{}] {}", self.severity.as_str().to_uppercase(), self.message),
            "attachments": [{
                "color": self.severity.color(),
                "fields": fields,
                "timestamp": self.timestamp.timestamp(),
            }],
        })
    }
}

/// Destination for alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => error!(
                severity = alert.severity.as_str(),
                alert_type = %alert.alert_type,
                details = %alert.details,
                "{}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                alert_type = %alert.alert_type,
                details = %alert.details,
                "{}", alert.message
            ),
            AlertSeverity::Info => info!(
                alert_type = %alert.alert_type,
                details = %alert.details,
                "{}", alert.message
            ),
        }
        Ok(())
    }
}

/// Posts alerts to an incoming-webhook URL with exponential-backoff retry
pub struct WebhookAlertSink {
    client: Client,
    url: String,
    retry_delays: Vec<Duration>,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            retry_delays: RETRY_DELAYS_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        })
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    async fn try_send(&self, payload: &Value) -> Result<()> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Internal(format!(
                "Webhook returned HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let payload = alert.webhook_payload();

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            match self.try_send(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt = attempt + 1, url = %self.url, error = %e, "Alert delivery failed, retrying");
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        self.try_send(&payload).await.map_err(|e| {
            error!(url = %self.url, error = %e, "Alert delivery failed after all retries");
            e
        })
    }
}
