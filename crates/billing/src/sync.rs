//! Sync recovery
//!
//! On-demand reconciliation for when local subscription state is
//! suspected stale: the plan card shows neither a real subscription
//! nor the free fallback, or a webhook was missed. Re-pulls the
//! authoritative state from the provider and rewrites the local
//! snapshot only when it actually differs, so repeated calls with no
//! provider-side change are no-ops.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use quotekit_shared::Subscription;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventBus};
use crate::ledger::SubscriptionRepo;
use crate::provider::PaymentProvider;

#[derive(Debug, Clone, Serialize)]
pub struct ResyncOutcome {
    pub changed: bool,
    pub message: String,
}

pub struct SyncRecoveryService {
    provider: Arc<dyn PaymentProvider>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    events: EventBus,
}

impl SyncRecoveryService {
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

    /// Detect drift in the local view: a snapshot that claims a paid
    /// status without provider references can render neither real
    /// subscription data nor the free fallback.
    pub fn detect_drift(local: Option<&Subscription>) -> BillingResult<()> {
        if let Some(sub) = local {
            if sub.status.is_paid() && sub.provider_subscription_id.is_none() {
                return Err(BillingError::StateDrift(
                    "subscription marked paid but has no provider reference; run resync or contact support"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Re-pull authoritative subscription state from the provider.
    ///
    /// Idempotent: when local and provider state already agree, nothing
    /// is written and `changed` is false. Failures are non-fatal and
    /// reported for a manual retry.
    pub async fn resync(&self, user_id: Uuid) -> BillingResult<ResyncOutcome> {
        let customer_id = match self.subscriptions.get(user_id).await? {
            Some(sub) => sub.provider_customer_id,
            None => None,
        };

        let remote = match customer_id.as_deref() {
            Some(customer) => self.provider.fetch_subscription(customer).await?,
            // Without a customer reference there is nothing provider-side
            // to reconcile against; the free fallback is authoritative.
            None => None,
        };

        let local = self.subscriptions.get(user_id).await?;

        // Compare only the provider-owned fields; the local row also
        // carries sync bookkeeping we do not want to diff.
        let in_sync = match (&local, &remote) {
            (None, None) => true,
            (Some(l), Some(r)) => l == r,
            (Some(l), None) => l.is_free(),
            (None, Some(_)) => false,
        };

        if in_sync {
            tracing::debug!(user_id = %user_id, "Resync found no drift");
            return Ok(ResyncOutcome {
                changed: false,
                message: "Subscription already in sync with the payment provider".to_string(),
            });
        }

        self.subscriptions.replace(user_id, remote.as_ref()).await?;
        self.events.emit(BillingEvent::InvalidateBillingHistory);

        let message = match &remote {
            Some(sub) => format!(
                "Subscription restored from provider records (status: {})",
                sub.status
            ),
            None => "No provider subscription found; reverted to the free plan".to_string(),
        };

        tracing::info!(
            user_id = %user_id,
            remote_status = ?remote.as_ref().map(|s| s.status),
            "Resync rewrote local subscription state"
        );

        Ok(ResyncOutcome {
            changed: true,
            message,
        })
    }
}
