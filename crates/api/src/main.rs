//! QuoteKit Billing API Server
//!
//! HTTP surface for the billing subsystem: plan changes, payment
//! methods, billing history, subscription lifecycle, sync recovery,
//! and a live event stream.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotekit_billing::BillingService;
use quotekit_shared::create_pool;

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quotekit_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting QuoteKit Billing API v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    quotekit_shared::run_migrations(&pool).await?;
    tracing::info!("Migrations up to date");

    let billing = Arc::new(BillingService::from_env(pool.clone()).await?);
    tracing::info!(
        price_count = billing.catalog.prices().len(),
        "Billing service initialized"
    );

    let state = AppState::new(pool, config.clone(), billing);

    // Restrict CORS to the configured origins; default covers local
    // development of the quote-management UI.
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    tracing::info!(allowed_origins = ?allowed_origins, "CORS configured");

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            axum::http::HeaderName::from_static("x-user-id"),
        ])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
