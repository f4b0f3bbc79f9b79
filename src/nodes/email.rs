//! ACTION_EMAIL node and the email delivery collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::template::render_template;
use super::types::{NodeContext, Outcome};
use crate::config::EmailConfig;
use crate::error::{Error, ErrorCategory, Result};
use crate::workflow::EmailData;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub from: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailReceipt {
    pub message_id: String,
}

/// Delivers emails. Implementations own their retry behaviour.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Provider name, for logs and metrics.
    fn provider(&self) -> &str;

    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt>;
}

/// Evaluate an ACTION_EMAIL node.
///
/// On success the receipt is recorded in the variables as
/// `lastEmailMessageId`, and `emailsSent` is incremented.
pub async fn execute(data: &EmailData, ctx: &mut NodeContext, sender: &dyn EmailSender) -> Outcome {
    let to = match &data.to {
        Some(template) => render_template(template, ctx),
        None => ctx
            .variables
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };
    if to.trim().is_empty() || to.contains("{{") {
        return Outcome::Fail("no recipient address for email".to_string());
    }

    let message = EmailMessage {
        to,
        from: data.from.as_ref().map(|f| render_template(f, ctx)),
        subject: render_template(&data.subject, ctx),
        body: render_template(&data.body, ctx),
    };

    debug!(
        provider = sender.provider(),
        workflow_id = %ctx.workflow_id,
        lead_id = %ctx.lead_id,
        to = %message.to,
        subject = %message.subject,
        "Sending email"
    );

    match sender.send(&message).await {
        Ok(receipt) => {
            crate::metrics::record_email(sender.provider(), true);
            let sent = ctx
                .variables
                .get("emailsSent")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            ctx.variables
                .insert("lastEmailMessageId".into(), json!(receipt.message_id));
            ctx.variables.insert("emailsSent".into(), json!(sent + 1));
            Outcome::Advance(None)
        }
        Err(e) => {
            crate::metrics::record_email(sender.provider(), false);
            Outcome::Fail(format!("email delivery failed: {}", e))
        }
    }
}

// =============================================================================
// Senders
// =============================================================================

/// Logs messages instead of delivering them. Useful for local runs.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    fn provider(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        let message_id = format!("<{}@leadflow.local>", uuid::Uuid::new_v4());
        info!(
            to = %message.to,
            subject = %message.subject,
            message_id = %message_id,
            "Email (log provider)"
        );
        Ok(EmailReceipt { message_id })
    }
}

/// Sends through the Resend HTTP API.
pub struct ResendEmailSender {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    default_from: String,
}

impl ResendEmailSender {
    pub fn new(api_key: impl Into<String>, default_from: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: RESEND_ENDPOINT.to_string(),
            default_from: default_from.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EmailSender for ResendEmailSender {
    fn provider(&self) -> &str {
        "resend"
    }

    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        let body = json!({
            "from": message.from.as_deref().unwrap_or(&self.default_from),
            "to": [message.to],
            "subject": message.subject,
            "text": message.body,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Email(format!("Resend request failed: {}", e)))?;

        let status = response.status();
        let response_body: Value = response.json().await.unwrap_or(json!({}));

        if status.is_success() {
            let message_id = response_body["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            Ok(EmailReceipt { message_id })
        } else if status.is_client_error() && status.as_u16() != 429 {
            Err(Error::EmailRejected(format!("Resend {}: {}", status, response_body)))
        } else {
            Err(Error::Email(format!("Resend error {}: {}", status, response_body)))
        }
    }
}

/// Backoff strategy between delivery attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Retry budget for email delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffType,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: BackoffType::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let ms = match self.backoff {
            BackoffType::Fixed => base,
            BackoffType::Linear => base.saturating_mul(attempt as u64),
            BackoffType::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Retries transient failures of an inner sender.
pub struct RetryingEmailSender {
    inner: Arc<dyn EmailSender>,
    policy: RetryPolicy,
}

impl RetryingEmailSender {
    pub fn new(inner: Arc<dyn EmailSender>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl EmailSender for RetryingEmailSender {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match self.inner.send(message).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if attempt < max_attempts && e.category() == ErrorCategory::Transient => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        provider = self.inner.provider(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Email send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the configured sender, wrapped in the retry policy.
pub fn email_sender_from_config(config: &EmailConfig) -> Result<Arc<dyn EmailSender>> {
    let inner: Arc<dyn EmailSender> = match config.provider.as_str() {
        "log" => Arc::new(LogEmailSender),
        "resend" => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| Error::Config("email.api_key is required for resend".into()))?;
            let mut sender = ResendEmailSender::new(api_key, config.from.clone());
            if let Some(endpoint) = &config.endpoint {
                sender = sender.with_endpoint(endpoint.clone());
            }
            Arc::new(sender)
        }
        other => {
            return Err(Error::Config(format!("Unknown email provider: {}", other)));
        }
    };
    Ok(Arc::new(RetryingEmailSender::new(inner, config.retry.clone())))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records every message; fails the first `failures` sends.
    #[derive(Default)]
    pub struct RecordingEmailSender {
        sent: Mutex<Vec<EmailMessage>>,
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl RecordingEmailSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmailSender for RecordingEmailSender {
        fn provider(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &EmailMessage) -> Result<EmailReceipt> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Email("provider unavailable".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(EmailReceipt {
                message_id: format!("msg-{}", attempt),
            })
        }
    }
}
