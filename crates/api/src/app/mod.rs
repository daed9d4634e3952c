//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend wiring (job store, task queue, object store, executor)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: response DTOs
//! - `errors.rs`: consistent `{ "error", "message" }` error responses

use std::sync::Arc;

use anyhow::Context;
use axum::{extract::DefaultBodyLimit, routing::get, Extension, Router};
use docdiff_infra::config::{AppConfig, Role};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::{AppServices, Backends};

/// Room for multipart boundaries and headers on top of the two files.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the full HTTP router.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let body_limit = services
        .gateway
        .limits()
        .max_bytes
        .saturating_mul(2)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/api/v1", routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(Extension(services))
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

/// Run the parts of the pipeline `role` asks for until Ctrl-C.
pub async fn run(role: Role, config: AppConfig) -> anyhow::Result<()> {
    let backends = Backends::from_config(&config).await?;

    let executor = role
        .runs_workers()
        .then(|| backends.executor(&config, services::pdf_engine(&config)).spawn());
    if executor.is_some() {
        tracing::info!(concurrency = config.worker_concurrency, "job executor running");
    }

    if role.runs_gateway() {
        let services = Arc::new(AppServices {
            gateway: backends.gateway(&config),
        });
        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        tracing::info!(addr = %listener.local_addr()?, role = %role, "listening");

        axum::serve(listener, build_app(services))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("http server failed")?;
    } else {
        shutdown_signal().await;
    }

    if let Some(executor) = executor {
        executor.shutdown().await;
    }
    backends.shutdown();
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
