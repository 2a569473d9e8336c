//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use quotekit_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Arc<BillingService>) -> Self {
        Self {
            pool,
            config,
            billing,
        }
    }
}
