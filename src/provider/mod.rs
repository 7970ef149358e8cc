mod http;
mod logging;

use async_trait::async_trait;
use std::sync::Arc;

use crate::outbox::{OutboxMessage, SendStatus};

pub use http::{classify_status, HttpEmailProvider, HttpProviderConfig, DEFAULT_BASE_URL};
pub use logging::LoggingEmailProvider;

// ============================================================================
// Email Provider - Adapter over a transactional-email service
// ============================================================================
//
// A provider never returns an error for provider-side problems. Everything
// is folded into one of four outcomes:
//
//   Sent   - accepted, optionally with the provider's message id
//   Quota  - rate or billing limit (402 / 429)
//   Retry  - transient (5xx, timeout, connection failure)
//   Failed - permanent (other statuses, missing configuration)
//
// ============================================================================

/// Classified result of a single provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub status: SendStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl SendResult {
    pub fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            status: SendStatus::Sent,
            provider_message_id,
            error: None,
        }
    }

    pub fn quota(error: impl Into<String>) -> Self {
        Self::unsent(SendStatus::Quota, error)
    }

    pub fn retry(error: impl Into<String>) -> Self {
        Self::unsent(SendStatus::Retry, error)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::unsent(SendStatus::Failed, error)
    }

    fn unsent(status: SendStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, message: &OutboxMessage) -> SendResult;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Which provider implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Log messages instead of delivering them
    Logging,
    /// Deliver through the HTTP email API
    Http,
}

pub fn build_provider(
    kind: ProviderKind,
    config: HttpProviderConfig,
) -> anyhow::Result<Arc<dyn EmailProvider>> {
    let provider: Arc<dyn EmailProvider> = match kind {
        ProviderKind::Logging => Arc::new(LoggingEmailProvider::new()),
        ProviderKind::Http => Arc::new(HttpEmailProvider::new(config)?),
    };
    tracing::info!(provider = provider.name(), "Email provider configured");
    Ok(provider)
}
