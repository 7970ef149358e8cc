use clap::Parser;
use std::time::Duration;
use thiserror::Error;

use crate::outbox::{DeliveryPolicy, SweeperConfig};
use crate::provider::{HttpProviderConfig, ProviderKind, DEFAULT_BASE_URL};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: i64 },

    #[error(
        "claim_lease_seconds ({lease_seconds}) must cover a full batch of provider timeouts ({required_seconds}s)"
    )]
    LeaseTooShort {
        lease_seconds: i64,
        required_seconds: u64,
    },
}

/// Mail outbox service settings. Every flag can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "mail_outbox")]
#[command(about = "Transactional email outbox with retrying delivery")]
#[command(version)]
pub struct Settings {
    /// PostgreSQL connection string; the in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Database pool size
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    pub database_max_connections: u32,

    /// Attempts before a message is failed without calling the provider
    #[arg(long, env = "OUTBOX_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Base delay for transient failures, multiplied by the attempt count
    #[arg(long, env = "OUTBOX_RETRY_DELAY_SECONDS", default_value_t = 60, allow_negative_numbers = true)]
    pub retry_delay_seconds: i64,

    /// Flat delay after a quota response
    #[arg(long, env = "OUTBOX_QUOTA_DELAY_MINUTES", default_value_t = 60, allow_negative_numbers = true)]
    pub quota_delay_minutes: i64,

    /// Maximum messages claimed per sweep
    #[arg(long, env = "OUTBOX_BATCH_SIZE", default_value_t = 20)]
    pub batch_size: usize,

    /// Time between sweeps
    #[arg(long, env = "OUTBOX_SWEEP_INTERVAL_MS", default_value_t = 30_000)]
    pub sweep_interval_ms: u64,

    /// How long a claimed message stays reserved for this worker
    #[arg(long, env = "OUTBOX_CLAIM_LEASE_SECONDS", default_value_t = 300)]
    pub claim_lease_seconds: i64,

    /// Claimant identity; generated when absent
    #[arg(long, env = "OUTBOX_WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "EMAIL_PROVIDER", value_enum, default_value_t = ProviderKind::Logging)]
    pub provider: ProviderKind,

    #[arg(long, env = "RESEND_API_KEY", default_value = "", hide_env_values = true)]
    pub provider_api_key: String,

    #[arg(long, env = "RESEND_FROM", default_value = "")]
    pub provider_from: String,

    #[arg(long, env = "RESEND_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub provider_base_url: String,

    #[arg(long, env = "RESEND_TIMEOUT_SECONDS", default_value_t = 10)]
    pub provider_timeout_seconds: u64,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Enqueue one test email to this address at startup
    #[arg(long)]
    pub demo_recipient: Option<String>,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::MustBePositive { field: "max_attempts" });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::MustBePositive { field: "batch_size" });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::MustBePositive { field: "sweep_interval_ms" });
        }
        if self.claim_lease_seconds <= 0 {
            return Err(ConfigError::MustBePositive { field: "claim_lease_seconds" });
        }
        if self.database_max_connections == 0 {
            return Err(ConfigError::MustBePositive { field: "database_max_connections" });
        }
        if self.retry_delay_seconds < 0 {
            return Err(ConfigError::Negative {
                field: "retry_delay_seconds",
                value: self.retry_delay_seconds,
            });
        }
        if self.quota_delay_minutes < 0 {
            return Err(ConfigError::Negative {
                field: "quota_delay_minutes",
                value: self.quota_delay_minutes,
            });
        }
        // A sweep dispatches its batch sequentially; the last message must
        // still be leased when its provider call times out
        if self.provider == ProviderKind::Http {
            let required_seconds =
                (self.batch_size as u64).saturating_mul(self.provider_timeout_seconds);
            if (self.claim_lease_seconds as u64) < required_seconds {
                return Err(ConfigError::LeaseTooShort {
                    lease_seconds: self.claim_lease_seconds,
                    required_seconds,
                });
            }
        }
        Ok(())
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.max_attempts,
            retry_delay_seconds: self.retry_delay_seconds,
            quota_delay_minutes: self.quota_delay_minutes,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        let defaults = SweeperConfig::default();
        SweeperConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
            batch_size: self.batch_size,
            claim_lease: chrono::Duration::seconds(self.claim_lease_seconds),
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
        }
    }

    pub fn http_provider_config(&self) -> HttpProviderConfig {
        HttpProviderConfig {
            api_key: self.provider_api_key.clone(),
            from: self.provider_from.clone(),
            base_url: self.provider_base_url.clone(),
            timeout: Duration::from_secs(self.provider_timeout_seconds),
        }
    }
}
