//! Subscription lifecycle operations
//!
//! Cancel and reactivate are thin wrappers over the provider: the
//! provider commits the change, the local snapshot follows, and the
//! display layer is told to re-fetch.

use std::sync::Arc;

use uuid::Uuid;

use quotekit_shared::Subscription;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventBus};
use crate::ledger::SubscriptionRepo;
use crate::provider::PaymentProvider;

pub struct SubscriptionService {
    provider: Arc<dyn PaymentProvider>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    events: EventBus,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        subscriptions: Arc<dyn SubscriptionRepo>,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            subscriptions,
            events,
        }
    }

    /// The user's subscription, falling back to the free plan when no
    /// snapshot exists.
    pub async fn current(&self, user_id: Uuid) -> BillingResult<Subscription> {
        Ok(self
            .subscriptions
            .get(user_id)
            .await?
            .unwrap_or_else(Subscription::free))
    }

    /// Cancel the subscription, at period end by default.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let subscription_id = self.require_subscription_id(user_id).await?;
        let updated = self
            .provider
            .cancel_subscription(&subscription_id, cancel_at_period_end)
            .await?;

        self.subscriptions.replace(user_id, Some(&updated)).await?;
        self.events.emit(BillingEvent::InvalidateBillingHistory);

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            cancel_at_period_end = cancel_at_period_end,
            "Cancelled subscription"
        );
        Ok(updated)
    }

    /// Undo a pending cancellation while still inside the grace period.
    pub async fn reactivate(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let subscription_id = self.require_subscription_id(user_id).await?;
        let updated = self
            .provider
            .reactivate_subscription(&subscription_id)
            .await?;

        self.subscriptions.replace(user_id, Some(&updated)).await?;
        self.events.emit(BillingEvent::InvalidateBillingHistory);

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Reactivated subscription"
        );
        Ok(updated)
    }

    async fn require_subscription_id(&self, user_id: Uuid) -> BillingResult<String> {
        self.subscriptions
            .get(user_id)
            .await?
            .and_then(|s| s.provider_subscription_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))
    }
}
