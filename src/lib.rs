pub mod config;
pub mod metrics;
pub mod outbox;
pub mod provider;
pub mod utils;

pub use config::{ConfigError, Settings};
pub use metrics::Metrics;
pub use outbox::{
    DeliveryPolicy, EnqueueGateway, Outbox, OutboxMessage, OutboxStatus, OutboxStore,
    RetrySweeper, SendStatus, StoreError, SweeperConfig,
};
pub use provider::{EmailProvider, SendResult};
