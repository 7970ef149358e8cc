use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mail_outbox::metrics::{self, Metrics};
use mail_outbox::outbox::{InMemoryOutboxStore, Outbox, OutboxStore, PgOutboxStore};
use mail_outbox::provider::build_provider;
use mail_outbox::utils::SystemClock;
use mail_outbox::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mail_outbox=debug")),
        )
        .init();

    let settings = Settings::parse();
    settings.validate()?;

    tracing::info!("🚀 Starting mail outbox");

    // === 1. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 2. Open the outbox store ===
    let store: Arc<dyn OutboxStore> = match &settings.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let store = PgOutboxStore::connect(url, settings.database_max_connections).await?;
            store.ensure_schema().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (messages are lost on exit)");
            Arc::new(InMemoryOutboxStore::new())
        }
    };

    // Start metrics HTTP server in background thread
    let metrics_registry = Arc::new(metrics.registry().clone());
    let ops_store = store.clone();
    let metrics_port = settings.metrics_port;
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Metrics runtime error: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, ops_store, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 3. Wire provider, engine, gateway and sweeper ===
    let provider = build_provider(settings.provider, settings.http_provider_config())?;
    let outbox = Outbox::new(
        store,
        provider,
        Arc::new(SystemClock),
        settings.delivery_policy(),
        settings.sweeper_config(),
        metrics.clone(),
    );

    let cancel = CancellationToken::new();
    let sweeper_handle = outbox.sweeper().spawn(cancel.clone());

    // === 4. Optional demo send ===
    if let Some(recipient) = &settings.demo_recipient {
        tracing::info!("📝 Sending demo email to {}", recipient);
        let status = outbox
            .gateway()
            .enqueue_and_send(recipient, "Mail outbox demo", "Delivered through the outbox.")
            .await?;
        tracing::info!("Demo email outcome: {}", status);
    }

    tracing::info!("✅ Mail outbox running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    sweeper_handle.await?;

    tracing::info!("👋 Mail outbox stopped");
    Ok(())
}
