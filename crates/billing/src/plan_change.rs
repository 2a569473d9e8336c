//! Plan change orchestration
//!
//! State machine coordinating selection, proration preview, payment
//! validation, and commit of a plan change. Sessions are scoped to one
//! dialog-open lifecycle: opened with the current subscription, closed
//! on dismiss or completion, never shared across users or dialogs.
//!
//! Upgrades take effect immediately with a prorated charge and require
//! a valid payment method; downgrades take effect at period end with
//! no charge and no payment gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use quotekit_shared::{PaymentMethod, Subscription};

use crate::catalog::PricingCatalog;
use crate::error::{BillingError, BillingResult, ValidationError};
use crate::events::{BillingEvent, EventBus};
use crate::ledger::{PlanChangeLogRepo, PlanChangeRecord, SubscriptionRepo};
use crate::payment_methods::{select_default, PaymentMethodIssue, PaymentMethodStore};
use crate::proration::ProrationEstimator;
use crate::provider::{PaymentProvider, PlanChangeOutcome, ProrationPreview};

/// Delayed history re-checks after a successful commit. The provider
/// creates its invoice record asynchronously via webhook, so the first
/// refresh often lands before the invoice exists; the re-checks pick
/// it up. Redundant fetches are safe: the reconciler de-duplicates.
pub const WEBHOOK_LAG_RECHECKS: [Duration; 2] =
    [Duration::from_secs(2), Duration::from_secs(5)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeState {
    Idle,
    SelectingPlan,
    PreviewLoading,
    ValidatingPayment,
    Committing,
    Succeeded,
    Failed,
}

/// The in-flight user selection, discarded on close or completion.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeIntent {
    pub candidate_price_id: String,
    pub payment_method_id: Option<String>,
    pub is_upgrade: bool,
}

/// Ticket for an in-flight preview fetch. Carries the selection
/// sequence that initiated it so late responses can be matched against
/// the current selection and discarded when stale.
#[derive(Debug)]
pub struct PreviewRequest {
    seq: u64,
    price_id: String,
}

/// Result of a commit. `Redirect` is a terminal hand-off to an
/// external checkout page: not a failure, no error banner, and the
/// dialog's loading state is left as-is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitOutcome {
    Completed { subscription: Subscription },
    Redirect { checkout_url: String },
}

/// Per-dialog state. All fields are private; the orchestrator is the
/// only writer.
#[derive(Debug)]
pub struct PlanChangeSession {
    user_id: Uuid,
    subscription: Subscription,
    state: PlanChangeState,
    intent: Option<PlanChangeIntent>,
    preview: Option<ProrationPreview>,
    last_error: Option<String>,
    selection_seq: u64,
    defaults_applied: bool,
    closed: bool,
}

impl PlanChangeSession {
    pub fn state(&self) -> PlanChangeState {
        self.state
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn intent(&self) -> Option<&PlanChangeIntent> {
        self.intent.as_ref()
    }

    pub fn preview(&self) -> Option<&ProrationPreview> {
        self.preview.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub struct PlanChangeOrchestrator {
    provider: Arc<dyn PaymentProvider>,
    payment_methods: Arc<PaymentMethodStore>,
    estimator: ProrationEstimator,
    catalog: PricingCatalog,
    plan_changes: Arc<dyn PlanChangeLogRepo>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    events: EventBus,
    refresh_delays: [Duration; 2],
}

impl PlanChangeOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        payment_methods: Arc<PaymentMethodStore>,
        catalog: PricingCatalog,
        plan_changes: Arc<dyn PlanChangeLogRepo>,
        subscriptions: Arc<dyn SubscriptionRepo>,
        events: EventBus,
    ) -> Self {
        Self {
            estimator: ProrationEstimator::new(provider.clone()),
            provider,
            payment_methods,
            catalog,
            plan_changes,
            subscriptions,
            events,
            refresh_delays: WEBHOOK_LAG_RECHECKS,
        }
    }

    /// Shorten the webhook-lag re-check delays. Test hook.
    pub fn with_refresh_delays(mut self, delays: [Duration; 2]) -> Self {
        self.refresh_delays = delays;
        self
    }

    /// Open a plan-change dialog for the user's current subscription.
    pub fn open(&self, user_id: Uuid, subscription: Subscription) -> PlanChangeSession {
        PlanChangeSession {
            user_id,
            subscription,
            state: PlanChangeState::SelectingPlan,
            intent: None,
            preview: None,
            last_error: None,
            selection_seq: 0,
            defaults_applied: false,
            closed: false,
        }
    }

    /// Close the dialog. In-flight preview results arriving afterwards
    /// are discarded instead of being applied to a dismissed dialog.
    pub fn close(&self, session: &mut PlanChangeSession) {
        session.closed = true;
        session.state = PlanChangeState::Idle;
        session.intent = None;
        session.preview = None;
        session.last_error = None;
    }

    /// Record a candidate price selection. Returns a preview request
    /// for upgrade candidates; downgrades never preview because they
    /// take effect at period end with no immediate charge.
    pub fn begin_selection(
        &self,
        session: &mut PlanChangeSession,
        price_id: &str,
    ) -> BillingResult<Option<PreviewRequest>> {
        if session.closed {
            return Err(BillingError::Internal(
                "plan-change dialog is closed".to_string(),
            ));
        }

        let price = self.catalog.require(price_id)?;
        let is_upgrade = self.catalog.is_upgrade(&session.subscription, price);

        // The payment-method choice survives candidate switches; the
        // preview does not.
        let payment_method_id = session
            .intent
            .take()
            .and_then(|intent| intent.payment_method_id);

        session.intent = Some(PlanChangeIntent {
            candidate_price_id: price_id.to_string(),
            payment_method_id,
            is_upgrade,
        });
        session.preview = None;
        session.last_error = None;
        session.selection_seq += 1;

        if is_upgrade {
            session.state = PlanChangeState::PreviewLoading;
            Ok(Some(PreviewRequest {
                seq: session.selection_seq,
                price_id: price_id.to_string(),
            }))
        } else {
            session.state = PlanChangeState::SelectingPlan;
            Ok(None)
        }
    }

    /// Fetch the proration preview for a request issued by
    /// [`Self::begin_selection`].
    pub async fn fetch_preview(
        &self,
        subscription: &Subscription,
        request: &PreviewRequest,
    ) -> BillingResult<ProrationPreview> {
        self.estimator.preview(subscription, &request.price_id).await
    }

    /// Apply a preview result to the session. A response whose
    /// initiating selection is no longer current, or whose dialog has
    /// been closed, is discarded.
    pub fn apply_preview(
        &self,
        session: &mut PlanChangeSession,
        request: PreviewRequest,
        result: BillingResult<ProrationPreview>,
    ) {
        if session.closed || session.selection_seq != request.seq {
            tracing::debug!(
                request_seq = request.seq,
                current_seq = session.selection_seq,
                closed = session.closed,
                "Discarding stale proration preview"
            );
            return;
        }

        if session.state == PlanChangeState::PreviewLoading {
            session.state = PlanChangeState::SelectingPlan;
        }

        match result {
            Ok(preview) => session.preview = Some(preview),
            Err(e) if e.is_non_fatal() => {
                // Preview panel stays disabled; the flow continues.
                tracing::warn!(error = %e, "Proration preview unavailable");
                session.preview = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Proration preview fetch failed");
                session.preview = None;
            }
        }
    }

    /// Convenience wrapper: select a candidate and resolve its preview
    /// in one call.
    pub async fn select_candidate(
        &self,
        session: &mut PlanChangeSession,
        price_id: &str,
    ) -> BillingResult<()> {
        if let Some(request) = self.begin_selection(session, price_id)? {
            let subscription = session.subscription.clone();
            let result = self.fetch_preview(&subscription, &request).await;
            self.apply_preview(session, request, result);
        }
        Ok(())
    }

    /// Select the payment method to charge. Invalidates the preview;
    /// the caller re-selects the candidate to refresh it.
    pub fn select_payment_method(&self, session: &mut PlanChangeSession, payment_method_id: &str) {
        if let Some(intent) = session.intent.as_mut() {
            intent.payment_method_id = Some(payment_method_id.to_string());
            session.preview = None;
        }
    }

    /// Load payment methods and apply the default-selection policy.
    /// The policy runs once per dialog-open lifecycle so it never
    /// fights a choice the user already made.
    async fn load_methods_with_default(
        &self,
        session: &mut PlanChangeSession,
    ) -> BillingResult<(Vec<PaymentMethod>, HashMap<String, PaymentMethodIssue>)> {
        let customer_id = session
            .subscription
            .provider_customer_id
            .clone()
            .ok_or_else(|| BillingError::StateDrift("paid subscription without customer reference".to_string()))?;

        let (methods, issues) = self.payment_methods.list_validated(&customer_id).await?;

        if !session.defaults_applied {
            session.defaults_applied = true;
            if let Some(intent) = session.intent.as_mut() {
                if intent.payment_method_id.is_none() {
                    intent.payment_method_id =
                        select_default(&methods, &issues).map(|m| m.id.clone());
                }
            }
        }

        Ok((methods, issues))
    }

    fn validate_payment(
        intent: &PlanChangeIntent,
        methods: &[PaymentMethod],
        issues: &HashMap<String, PaymentMethodIssue>,
    ) -> Result<(), ValidationError> {
        let any_valid = methods.iter().any(|m| !issues.contains_key(&m.id));

        match intent.payment_method_id.as_deref() {
            None if methods.is_empty() || !any_valid => Err(ValidationError::NoPaymentMethods),
            None => Err(ValidationError::NoPaymentMethodSelected),
            Some(selected) => {
                if !methods.iter().any(|m| m.id == selected) {
                    return Err(ValidationError::NoPaymentMethodSelected);
                }
                if issues.contains_key(selected) {
                    return Err(ValidationError::PaymentMethodExpired);
                }
                Ok(())
            }
        }
    }

    /// Commit the selected plan change.
    ///
    /// The payment gate applies iff the candidate is an upgrade of an
    /// existing provider subscription. Free-to-paid commits go straight
    /// to the provider, which answers with a checkout redirect when it
    /// needs to collect payment externally.
    pub async fn commit(&self, session: &mut PlanChangeSession) -> BillingResult<CommitOutcome> {
        if session.closed {
            return Err(BillingError::Internal(
                "plan-change dialog is closed".to_string(),
            ));
        }

        let intent = session
            .intent
            .clone()
            .ok_or(ValidationError::MissingCandidatePlan)?;

        if intent.is_upgrade && session.subscription.provider_subscription_id.is_some() {
            session.state = PlanChangeState::ValidatingPayment;
            let (methods, issues) = match self.load_methods_with_default(session).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    // The dialog must not be stranded mid-validation;
                    // surface the outage like any other commit failure.
                    session.state = PlanChangeState::Failed;
                    session.last_error = Some(e.to_string());
                    tracing::warn!(
                        user_id = %session.user_id,
                        error = %e,
                        "Payment method lookup failed during commit"
                    );
                    return Err(e);
                }
            };

            // Default selection may have just filled in the method.
            let intent_now = session
                .intent
                .clone()
                .ok_or(ValidationError::MissingCandidatePlan)?;

            if let Err(violation) = Self::validate_payment(&intent_now, &methods, &issues) {
                session.state = PlanChangeState::SelectingPlan;
                session.last_error = Some(violation.to_string());
                return Err(violation.into());
            }
        }

        session.state = PlanChangeState::Committing;

        let intent = session
            .intent
            .clone()
            .ok_or(ValidationError::MissingCandidatePlan)?;
        let customer_id = session.subscription.provider_customer_id.clone();
        let subscription_id = session.subscription.provider_subscription_id.clone();

        let outcome = self
            .provider
            .change_plan(
                customer_id.as_deref(),
                subscription_id.as_deref(),
                &intent.candidate_price_id,
                intent.is_upgrade,
                intent.payment_method_id.as_deref(),
            )
            .await;

        match outcome {
            Ok(PlanChangeOutcome::Completed { subscription }) => {
                session.state = PlanChangeState::Succeeded;
                self.record_completed_change(session, &intent, &subscription)
                    .await;
                session.subscription = subscription.clone();

                self.events.emit(BillingEvent::PlanChangeCompleted);
                self.schedule_history_refresh();

                tracing::info!(
                    user_id = %session.user_id,
                    price_id = %intent.candidate_price_id,
                    is_upgrade = intent.is_upgrade,
                    "Plan change committed"
                );
                Ok(CommitOutcome::Completed { subscription })
            }
            Ok(PlanChangeOutcome::Redirect { checkout_url }) => {
                // Terminal hand-off: the rest of the flow happens on
                // the external checkout page. Not a failure, so no
                // error banner and the loading state is left alone.
                tracing::info!(
                    user_id = %session.user_id,
                    price_id = %intent.candidate_price_id,
                    "Plan change handed off to external checkout"
                );
                Ok(CommitOutcome::Redirect { checkout_url })
            }
            Err(e) => {
                session.state = PlanChangeState::Failed;
                session.last_error = Some(e.to_string());
                tracing::warn!(
                    user_id = %session.user_id,
                    price_id = %intent.candidate_price_id,
                    error = %e,
                    "Plan change failed"
                );
                Err(e)
            }
        }
    }

    /// Dismiss a failure banner. The candidate selection is retained so
    /// the user can retry without re-picking.
    pub fn acknowledge_failure(&self, session: &mut PlanChangeSession) {
        if session.state == PlanChangeState::Failed {
            session.state = PlanChangeState::SelectingPlan;
            session.last_error = None;
        }
    }

    /// Persist the change locally. Best-effort: the provider already
    /// committed, so a local write failure is logged rather than
    /// surfaced as a failed plan change.
    async fn record_completed_change(
        &self,
        session: &PlanChangeSession,
        intent: &PlanChangeIntent,
        updated: &Subscription,
    ) {
        let amount_cents = self
            .catalog
            .get(&intent.candidate_price_id)
            .map(|p| p.amount_cents)
            .unwrap_or(0);

        let record = PlanChangeRecord {
            id: format!("chg_{}", Uuid::new_v4()),
            user_id: session.user_id,
            from_price_id: session.subscription.price_id.clone(),
            to_price_id: intent.candidate_price_id.clone(),
            amount_cents,
            status: "completed".to_string(),
            changed_at: OffsetDateTime::now_utc(),
        };

        if let Err(e) = self.plan_changes.record(&record).await {
            tracing::warn!(error = %e, "Failed to record plan change locally");
        }
        if let Err(e) = self
            .subscriptions
            .replace(session.user_id, Some(updated))
            .await
        {
            tracing::warn!(error = %e, "Failed to update local subscription snapshot");
        }
    }

    /// Refresh billing history now, then twice more after the
    /// configured delays to compensate for provider webhook lag. The
    /// re-checks are independent fire-and-forget emissions.
    fn schedule_history_refresh(&self) {
        self.events.emit(BillingEvent::BillingHistoryUpdated);
        for delay in self.refresh_delays {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                events.emit(BillingEvent::BillingHistoryUpdated);
            });
        }
    }
}
