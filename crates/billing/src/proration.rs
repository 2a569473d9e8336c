//! Proration estimation for upgrades
//!
//! Downgrades never preview: they take effect at period end with no
//! immediate charge. The orchestrator enforces that gate; this module
//! handles the reference checks and the provider call.

use std::sync::Arc;

use quotekit_shared::Subscription;

use crate::error::{BillingError, BillingResult};
use crate::provider::{PaymentProvider, ProrationPreview};

pub struct ProrationEstimator {
    provider: Arc<dyn PaymentProvider>,
}

impl ProrationEstimator {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self { provider }
    }

    /// Ask the provider what moving to `price_id` costs right now.
    ///
    /// A subscription without provider references (the free fallback)
    /// yields `PreviewUnavailable`, which callers treat as "preview
    /// panel disabled", never as a blocking error.
    pub async fn preview(
        &self,
        subscription: &Subscription,
        price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        let customer_id = subscription.provider_customer_id.as_deref().ok_or_else(|| {
            BillingError::PreviewUnavailable("no customer reference".to_string())
        })?;
        let subscription_id =
            subscription.provider_subscription_id.as_deref().ok_or_else(|| {
                BillingError::PreviewUnavailable("no subscription reference".to_string())
            })?;

        self.provider
            .preview_plan_change(customer_id, subscription_id, price_id)
            .await
    }
}
