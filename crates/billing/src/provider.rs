//! Payment provider abstraction
//!
//! The processor's own wire protocol (card tokenization, charge
//! execution) is out of scope; this trait is the opaque surface the
//! rest of the subsystem consumes. The production implementation is
//! [`crate::rest::RestPaymentProvider`]; tests use the in-memory mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use quotekit_shared::{PaymentMethod, Subscription};

use crate::error::BillingResult;

/// Tagged result of a plan change.
///
/// `Redirect` is a control signal, not a failure: the remaining steps
/// (typically payment collection for a free-to-paid transition) happen
/// on an external checkout page. Callers must not log or display it as
/// an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanChangeOutcome {
    Completed { subscription: Subscription },
    Redirect { checkout_url: String },
}

/// Cost preview for an upgrade, computed fresh per candidate selection.
/// Never persisted; invalidated whenever the candidate price or payment
/// method changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProrationPreview {
    /// What the card is charged right now.
    pub immediate_total_cents: i64,
    /// Credit for the unused remainder of the current period (negative)
    /// or additional prorated charge (positive).
    pub proration_amount_cents: i64,
    /// Total of the next regular invoice after the change.
    pub next_invoice_total_cents: i64,
    pub currency: String,
}

/// An invoice as reported by the provider. One of the three sources
/// merged by the billing-history reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub created: OffsetDateTime,
    pub amount_cents: i64,
    pub status: String,
    pub hosted_url: Option<String>,
    pub description: String,
}

/// Downloadable invoice resource.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDownload {
    pub invoice_id: String,
    pub url: String,
}

/// Opaque operations consumed from the payment processor.
///
/// Every method can fail with `ProviderUnavailable` on network/auth
/// errors. An empty payment-method list is a valid result, never an
/// error.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// List the customer's stored payment instruments.
    async fn list_payment_methods(&self, customer_id: &str) -> BillingResult<Vec<PaymentMethod>>;

    /// Mark a payment method as the default for recurring charges.
    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Detach a payment method. The "sole default" guard lives in
    /// `PaymentMethodStore`, not here.
    async fn delete_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Preview the cost of moving the subscription to `price_id`.
    async fn preview_plan_change(
        &self,
        customer_id: &str,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ProrationPreview>;

    /// Move the customer to a new price. Upgrades take effect
    /// immediately with proration; downgrades at period end. A missing
    /// subscription reference means a free-to-paid transition, which
    /// may hand off to hosted checkout (and a missing customer
    /// reference means the provider creates the customer there too).
    async fn change_plan(
        &self,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
        price_id: &str,
        is_upgrade: bool,
        payment_method_id: Option<&str>,
    ) -> BillingResult<PlanChangeOutcome>;

    /// Cancel at period end (or immediately when `false`).
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription>;

    /// Undo a pending cancellation within the grace period.
    async fn reactivate_subscription(&self, subscription_id: &str) -> BillingResult<Subscription>;

    /// Authoritative pull of the customer's current subscription, used
    /// by sync recovery. `None` means the customer has no subscription
    /// provider-side (the free fallback applies).
    async fn fetch_subscription(&self, customer_id: &str)
        -> BillingResult<Option<Subscription>>;

    /// Invoices the provider has recorded for this customer.
    async fn list_invoices(&self, customer_id: &str) -> BillingResult<Vec<ProviderInvoice>>;

    /// Resolve a downloadable resource for a finalized invoice.
    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceDownload>;
}
