// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError variants carry provider payloads
#![allow(clippy::too_many_arguments)] // Some provider operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! QuoteKit Billing Module
//!
//! Plan-change orchestration and billing display for the account area.
//!
//! ## Features
//!
//! - **Plan Changes**: Selection, proration preview, payment
//!   validation, and commit, driven by a per-dialog state machine
//! - **Payment Methods**: List, validate expiry, default selection,
//!   set-default and delete with a sole-default guard
//! - **Proration Preview**: Live upgrade cost estimates from the
//!   provider; downgrades never preview
//! - **Billing History**: Three local/remote sources reconciled into
//!   one de-duplicated, sortable, paginated view
//! - **Subscription Lifecycle**: Cancel at period end, reactivate
//! - **Sync Recovery**: On-demand resync of the local subscription
//!   snapshot against the provider
//! - **Events**: Broadcast bus driving live refresh of billing views

pub mod catalog;
pub mod error;
pub mod events;
pub mod history;
pub mod ledger;
pub mod payment_methods;
pub mod plan_change;
pub mod proration;
pub mod provider;
pub mod rest;
pub mod subscription;
pub mod sync;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
pub(crate) mod mocks;

// Catalog
pub use catalog::PricingCatalog;

// Error
pub use error::{BillingError, BillingResult, ValidationError};

// Events
pub use events::{BillingEvent, EventBus};

// History
pub use history::{
    reconcile, BillingHistoryRecord, BillingHistoryService, HistoryPage, HistoryQuery,
    HistorySortField, HistorySource, SortDirection,
};

// Ledger
pub use ledger::{
    BillingLedgerRepo, LedgerRecord, PgBillingLedgerRepo, PgPlanChangeLogRepo, PgSubscriptionRepo,
    PlanChangeLogRepo, PlanChangeRecord, SubscriptionRepo,
};

// Payment Methods
pub use payment_methods::{PaymentMethodIssue, PaymentMethodStore};

// Plan Change
pub use plan_change::{
    CommitOutcome, PlanChangeIntent, PlanChangeOrchestrator, PlanChangeSession, PlanChangeState,
    PreviewRequest,
};

// Proration
pub use proration::ProrationEstimator;

// Provider
pub use provider::{
    InvoiceDownload, PaymentProvider, PlanChangeOutcome, ProrationPreview, ProviderInvoice,
};
pub use rest::{ProviderConfig, RestPaymentProvider};

// Subscription
pub use subscription::SubscriptionService;

// Sync
pub use sync::{ResyncOutcome, SyncRecoveryService};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub payment_methods: Arc<PaymentMethodStore>,
    pub plan_changes: PlanChangeOrchestrator,
    pub history: BillingHistoryService,
    pub subscriptions: SubscriptionService,
    pub sync: SyncRecoveryService,
    pub subscription_repo: Arc<dyn SubscriptionRepo>,
    pub catalog: PricingCatalog,
    pub events: EventBus,
}

impl BillingService {
    /// Create a new billing service from environment variables. Loads
    /// the price catalog from the database.
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let provider = Arc::new(RestPaymentProvider::from_env()?);
        let catalog = PricingCatalog::load(&pool).await?;
        Ok(Self::new(provider, catalog, pool))
    }

    /// Create a new billing service with an explicit provider and
    /// catalog.
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        catalog: PricingCatalog,
        pool: PgPool,
    ) -> Self {
        let events = EventBus::new();
        let payment_methods = Arc::new(PaymentMethodStore::new(provider.clone()));
        let ledger: Arc<dyn BillingLedgerRepo> = Arc::new(PgBillingLedgerRepo::new(pool.clone()));
        let plan_change_log: Arc<dyn PlanChangeLogRepo> =
            Arc::new(PgPlanChangeLogRepo::new(pool.clone()));
        let subscription_repo: Arc<dyn SubscriptionRepo> =
            Arc::new(PgSubscriptionRepo::new(pool));

        Self {
            plan_changes: PlanChangeOrchestrator::new(
                provider.clone(),
                payment_methods.clone(),
                catalog.clone(),
                plan_change_log.clone(),
                subscription_repo.clone(),
                events.clone(),
            ),
            history: BillingHistoryService::new(provider.clone(), ledger, plan_change_log),
            subscriptions: SubscriptionService::new(
                provider.clone(),
                subscription_repo.clone(),
                events.clone(),
            ),
            sync: SyncRecoveryService::new(provider, subscription_repo.clone(), events.clone()),
            payment_methods,
            subscription_repo,
            catalog,
            events,
        }
    }
}
