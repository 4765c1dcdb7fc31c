//! MetricHub - DORA metrics aggregation server.
//!
//! # Overview
//!
//! MetricHub ingests deployment and incident events, keeps them in a durable
//! SQLite log plus partitioned in-memory indices, and serves the four DORA
//! metrics over any time window with a performance classification.
//!
//! # API Endpoints
//!
//! - `GET /api/v1/metrics/dora` - All four metrics plus classification
//! - `POST /api/v1/deployments` - Record a deployment
//! - `POST /api/v1/incidents` - Record an incident
//! - `POST /api/v1/incidents/:id/resolve` - Resolve an incident
//! - `POST /api/v1/webhook/:plugin` - Canonical plugin envelope
//! - `GET /api/v1/health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use metrichub::api::{self, AppState};
use metrichub::clock::SystemClock;
use metrichub::config::Config;
use metrichub::engine::MetricsEngine;
use metrichub::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("metrichub=info".parse()?))
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        db_url = %config.database_url,
        min_samples = config.engine.min_samples,
        "Starting MetricHub server"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    // Replays the durable log into the in-memory indices
    let engine = MetricsEngine::open(
        Arc::new(storage),
        config.engine.clone(),
        Arc::new(SystemClock),
    )
    .await?;
    info!(events = engine.store().len(), "Event store ready");

    let state = AppState {
        engine: Arc::new(engine),
    };
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "MetricHub is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("MetricHub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
