mod dispatch;
mod gateway;
mod message;
mod policy;
mod status;
mod store;
mod sweeper;

use std::sync::Arc;

use crate::metrics::Metrics;
use crate::provider::EmailProvider;
use crate::utils::Clock;

pub use dispatch::{DispatchEngine, ATTEMPTS_EXHAUSTED};
pub use gateway::EnqueueGateway;
pub use message::OutboxMessage;
pub use policy::DeliveryPolicy;
pub use status::{OutboxStatus, SendStatus, UnknownStatus};
pub use store::{
    InMemoryOutboxStore, OutboxStore, PgOutboxStore, StatusCounts, StoreError, StoreResult,
};
pub use sweeper::{RetrySweeper, SweepReport, SweeperConfig};

/// The wired outbox: one engine shared by the gateway and the sweeper.
pub struct Outbox {
    gateway: Arc<EnqueueGateway>,
    sweeper: Arc<RetrySweeper>,
    engine: Arc<DispatchEngine>,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        provider: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        policy: DeliveryPolicy,
        sweeper_config: SweeperConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let engine = Arc::new(DispatchEngine::new(
            store.clone(),
            provider,
            clock.clone(),
            policy,
            metrics.clone(),
        ));
        let gateway = Arc::new(EnqueueGateway::new(
            store.clone(),
            engine.clone(),
            clock.clone(),
            metrics.clone(),
            format!("{}:gateway", sweeper_config.worker_id),
            sweeper_config.claim_lease,
        ));
        let sweeper = Arc::new(RetrySweeper::new(
            store,
            engine.clone(),
            clock,
            sweeper_config,
            metrics,
        ));

        Self {
            gateway,
            sweeper,
            engine,
        }
    }

    pub fn gateway(&self) -> Arc<EnqueueGateway> {
        self.gateway.clone()
    }

    pub fn sweeper(&self) -> Arc<RetrySweeper> {
        self.sweeper.clone()
    }

    pub fn engine(&self) -> Arc<DispatchEngine> {
        self.engine.clone()
    }
}
