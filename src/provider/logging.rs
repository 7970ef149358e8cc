use async_trait::async_trait;
use uuid::Uuid;

use super::{EmailProvider, SendResult};
use crate::outbox::OutboxMessage;

/// Development provider: logs the message and reports it as delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmailProvider;

impl LoggingEmailProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EmailProvider for LoggingEmailProvider {
    async fn send(&self, message: &OutboxMessage) -> SendResult {
        let provider_id = format!("log-{}", Uuid::new_v4());
        tracing::info!(
            message_id = %message.id(),
            recipient = %message.recipient(),
            subject = %message.subject(),
            provider_id = %provider_id,
            "📧 Email logged (not delivered)"
        );
        SendResult::sent(Some(provider_id))
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
