use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::outbox::OutboxStore;

/// Shared state for the operational HTTP surface
struct OpsState {
    registry: Arc<Registry>,
    store: Arc<dyn OutboxStore>,
}

/// Start the metrics HTTP server
/// This should be called in a separate thread/runtime to avoid conflicts
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    store: Arc<dyn OutboxStore>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    let state = web::Data::new(OpsState { registry, store });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
            .route("/outbox/status", web::get().to(outbox_status_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(state: web::Data<OpsState>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "mail-outbox"
    }))
}

/// Per-status record counts, read straight from the store
async fn outbox_status_handler(state: web::Data<OpsState>) -> impl Responder {
    match state.store.counts_by_status().await {
        Ok(counts) => HttpResponse::Ok().json(counts),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read outbox counts");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": e.to_string()
            }))
        }
    }
}
