//! Email notifications

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use watchtower_core::{Error, Result};

/// Subject of the urgent-monitor email
pub const URGENT_SUBJECT: &str = "An urgent compliance monitor has detected a violation";

/// Template of the urgent-monitor email
pub const URGENT_TEMPLATE: &str = "urgent_monitor_flagged";

/// One templated email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub subject: String,
    pub to: Vec<String>,
    pub template: String,
    pub context: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, email: &Email) -> Result<()>;
}

/// Settings of the HTTP mail service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Endpoint accepting email requests; notifications are dropped when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_from")]
    pub from: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_from() -> String {
    "noreply@watchtower.local".to_string()
}

fn default_timeout() -> u64 {
    10
}

#[derive(Serialize)]
struct MailRequest<'a> {
    subject: &'a str,
    to: &'a [String],
    template: &'a str,
    context: &'a Value,
    from: &'a str,
}

/// Posts each email as JSON to the mail service
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
    ) -> Result<Self> {
        Self::with_timeout(endpoint, api_key, from, Duration::from_secs(default_timeout()))
    }

    fn with_timeout(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Notification(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            from: from.into(),
        })
    }

    /// Mailer for the configured endpoint, if any
    pub fn from_config(config: &NotificationConfig) -> Result<Option<Self>> {
        match &config.endpoint {
            Some(endpoint) => Self::with_timeout(
                endpoint.clone(),
                config.api_key.clone(),
                config.from.clone(),
                Duration::from_secs(config.timeout_secs),
            )
            .map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Notifier for HttpMailer {
    async fn send_email(&self, email: &Email) -> Result<()> {
        let body = MailRequest {
            subject: &email.subject,
            to: &email.to,
            template: &email.template,
            context: &email.context,
            from: &self.from,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Notification(format!("mail request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Notification(format!(
                "mail service returned {status}: {text}"
            )));
        }
        debug!(template = %email.template, recipients = email.to.len(), "Email sent");
        Ok(())
    }
}

/// Drops every email; used when no mail service is configured
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_email(&self, email: &Email) -> Result<()> {
        debug!(template = %email.template, "No mail service configured, dropping email");
        Ok(())
    }
}

/// Keeps every email in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Email>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_email(&self, email: &Email) -> Result<()> {
        self.sent.lock().push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config: NotificationConfig = serde_json::from_str("{}").unwrap();
        assert!(config.endpoint.is_none());
        assert_eq!(config.timeout_secs, 10);
        assert!(HttpMailer::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_request_shape() {
        let email = Email {
            subject: URGENT_SUBJECT.into(),
            to: vec!["a@x.io".into()],
            template: URGENT_TEMPLATE.into(),
            context: json!({"monitor_name": "MFA"}),
        };
        let body = MailRequest {
            subject: &email.subject,
            to: &email.to,
            template: &email.template,
            context: &email.context,
            from: "ops@x.io",
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["template"], json!("urgent_monitor_flagged"));
        assert_eq!(value["to"], json!(["a@x.io"]));
        assert_eq!(value["from"], json!("ops@x.io"));
    }

    #[tokio::test]
    async fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        let email = Email {
            subject: "s".into(),
            to: vec![],
            template: "t".into(),
            context: Value::Null,
        };
        notifier.send_email(&email).await.unwrap();
        assert_eq!(notifier.sent(), vec![email]);
        notifier.clear();
        assert!(notifier.sent().is_empty());
    }
}
