use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EmailProvider, SendResult};
use crate::outbox::{OutboxMessage, SendStatus};

pub const DEFAULT_BASE_URL: &str = "https://api.resend.com";

/// HTTP provider configuration.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Bearer token; blank means unconfigured
    pub api_key: String,
    /// Sender address; blank means unconfigured
    pub from: String,
    /// API root, `/emails` is appended
    pub base_url: String,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            from: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Delivers through `POST {base_url}/emails` with bearer authentication.
pub struct HttpEmailProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpEmailProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/emails", normalize_base_url(&config.base_url)),
            api_key: config.api_key,
            from: config.from,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Map a final HTTP status code onto an outcome.
pub fn classify_status(code: u16) -> SendStatus {
    match code {
        200..=299 => SendStatus::Sent,
        402 | 429 => SendStatus::Quota,
        500..=599 => SendStatus::Retry,
        _ => SendStatus::Failed,
    }
}

fn normalize_base_url(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL;
    }
    trimmed.strip_suffix('/').unwrap_or(trimmed)
}

/// Provider message id from a success body; absent for non-JSON or id-less bodies.
fn extract_id(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    serde_json::from_str::<SendEmailResponse>(body)
        .ok()
        .and_then(|response| response.id)
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send(&self, message: &OutboxMessage) -> SendResult {
        if self.api_key.trim().is_empty() {
            return SendResult::failed("email provider API key is not configured");
        }
        if self.from.trim().is_empty() {
            return SendResult::failed("email sender address is not configured");
        }

        let request = SendEmailRequest {
            from: &self.from,
            to: [message.recipient()],
            subject: message.subject(),
            text: message.body(),
        };

        tracing::debug!(
            url = %self.endpoint,
            message_id = %message.id(),
            "Sending email"
        );

        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(message_id = %message.id(), error = %e, "Email provider unreachable");
                return SendResult::retry(format!("provider communication failure: {}", e));
            }
        };

        let code = response.status().as_u16();
        match classify_status(code) {
            SendStatus::Sent => {
                // A body we cannot read does not undo an accepted send
                let body = response.text().await.unwrap_or_default();
                SendResult::sent(extract_id(&body))
            }
            SendStatus::Quota => SendResult::quota(format!("provider quota exceeded (HTTP {})", code)),
            SendStatus::Retry => {
                SendResult::retry(format!("provider temporarily unavailable (HTTP {})", code))
            }
            SendStatus::Failed => {
                let body = response.text().await.unwrap_or_default();
                tracing::debug!(status = code, body = %body, "Email provider rejected message");
                SendResult::failed(format!("provider rejected message (HTTP {})", code))
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
