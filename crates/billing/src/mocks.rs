//! In-memory test doubles for the provider and the local stores.
//!
//! `MockProvider` is configured by mutating its public fields before
//! handing it to the code under test; call counters let tests assert
//! how often the provider was hit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use quotekit_shared::{PaymentMethod, Subscription, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    BillingLedgerRepo, LedgerRecord, PlanChangeLogRepo, PlanChangeRecord, SubscriptionRepo,
};
use crate::provider::{
    InvoiceDownload, PaymentProvider, PlanChangeOutcome, ProrationPreview, ProviderInvoice,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct MockProvider {
    pub payment_methods: Mutex<Vec<PaymentMethod>>,
    pub preview: Mutex<Option<ProrationPreview>>,
    /// Outcome for the next `change_plan` call. When unset, a
    /// `Completed` outcome with an active subscription is synthesized.
    pub change_plan_outcome: Mutex<Option<PlanChangeOutcome>>,
    /// When set, `change_plan` fails with `ProviderUnavailable`.
    pub change_plan_error: Mutex<Option<String>>,
    /// When set, `list_payment_methods` fails with `ProviderUnavailable`.
    pub list_methods_error: Mutex<Option<String>>,
    pub subscription: Mutex<Option<Subscription>>,
    pub invoices: Mutex<Vec<ProviderInvoice>>,

    pub preview_calls: AtomicUsize,
    pub change_plan_calls: AtomicUsize,
    pub list_method_calls: AtomicUsize,
    pub fetch_subscription_calls: AtomicUsize,
}

impl MockProvider {
    pub fn with_payment_methods(self, methods: Vec<PaymentMethod>) -> Self {
        *lock(&self.payment_methods) = methods;
        self
    }

    pub fn with_preview(self, preview: ProrationPreview) -> Self {
        *lock(&self.preview) = Some(preview);
        self
    }

    pub fn with_change_plan_outcome(self, outcome: PlanChangeOutcome) -> Self {
        *lock(&self.change_plan_outcome) = Some(outcome);
        self
    }

    pub fn failing_change_plan(self, message: &str) -> Self {
        *lock(&self.change_plan_error) = Some(message.to_string());
        self
    }

    pub fn failing_payment_methods(self, message: &str) -> Self {
        *lock(&self.list_methods_error) = Some(message.to_string());
        self
    }

    pub fn with_subscription(self, subscription: Subscription) -> Self {
        *lock(&self.subscription) = Some(subscription);
        self
    }

    pub fn with_invoices(self, invoices: Vec<ProviderInvoice>) -> Self {
        *lock(&self.invoices) = invoices;
        self
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn list_payment_methods(&self, _customer_id: &str) -> BillingResult<Vec<PaymentMethod>> {
        self.list_method_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.list_methods_error).clone() {
            return Err(BillingError::ProviderUnavailable(message));
        }
        Ok(lock(&self.payment_methods).clone())
    }

    async fn set_default_payment_method(
        &self,
        _customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let mut methods = lock(&self.payment_methods);
        for method in methods.iter_mut() {
            method.is_default = method.id == payment_method_id;
        }
        Ok(())
    }

    async fn delete_payment_method(
        &self,
        _customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        lock(&self.payment_methods).retain(|m| m.id != payment_method_id);
        Ok(())
    }

    async fn preview_plan_change(
        &self,
        _customer_id: &str,
        _subscription_id: &str,
        _price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        self.preview_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.preview)
            .clone()
            .ok_or_else(|| BillingError::PreviewUnavailable("mock preview unset".to_string()))
    }

    async fn change_plan(
        &self,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
        price_id: &str,
        _is_upgrade: bool,
        _payment_method_id: Option<&str>,
    ) -> BillingResult<PlanChangeOutcome> {
        self.change_plan_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = lock(&self.change_plan_error).clone() {
            return Err(BillingError::ProviderUnavailable(message));
        }
        if let Some(outcome) = lock(&self.change_plan_outcome).clone() {
            return Ok(outcome);
        }

        Ok(PlanChangeOutcome::Completed {
            subscription: Subscription {
                provider_subscription_id: Some(
                    subscription_id.unwrap_or("sub_mock").to_string(),
                ),
                provider_customer_id: Some(customer_id.unwrap_or("cus_mock").to_string()),
                price_id: Some(price_id.to_string()),
                status: SubscriptionStatus::Active,
                current_period_start: None,
                current_period_end: None,
                cancel_at_period_end: false,
            },
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        cancel_at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let mut stored = lock(&self.subscription);
        let sub = stored
            .as_mut()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        if cancel_at_period_end {
            sub.cancel_at_period_end = true;
        } else {
            sub.status = SubscriptionStatus::Canceled;
        }
        Ok(sub.clone())
    }

    async fn reactivate_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let mut stored = lock(&self.subscription);
        let sub = stored
            .as_mut()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;
        sub.cancel_at_period_end = false;
        Ok(sub.clone())
    }

    async fn fetch_subscription(
        &self,
        _customer_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.subscription).clone())
    }

    async fn list_invoices(&self, _customer_id: &str) -> BillingResult<Vec<ProviderInvoice>> {
        Ok(lock(&self.invoices).clone())
    }

    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceDownload> {
        lock(&self.invoices)
            .iter()
            .find(|inv| inv.id == invoice_id)
            .map(|inv| InvoiceDownload {
                invoice_id: inv.id.clone(),
                url: inv
                    .hosted_url
                    .clone()
                    .unwrap_or_else(|| format!("https://invoices.test/{}", inv.id)),
            })
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionRepo {
    rows: Mutex<HashMap<Uuid, Subscription>>,
}

#[async_trait]
impl SubscriptionRepo for InMemorySubscriptionRepo {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(lock(&self.rows).get(&user_id).cloned())
    }

    async fn replace(
        &self,
        user_id: Uuid,
        subscription: Option<&Subscription>,
    ) -> BillingResult<()> {
        let mut rows = lock(&self.rows);
        match subscription {
            Some(sub) => {
                rows.insert(user_id, sub.clone());
            }
            None => {
                rows.remove(&user_id);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPlanChangeLog {
    records: Mutex<Vec<PlanChangeRecord>>,
}

impl InMemoryPlanChangeLog {
    pub fn with_records(records: Vec<PlanChangeRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl PlanChangeLogRepo for InMemoryPlanChangeLog {
    async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PlanChangeRecord>> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record(&self, record: &PlanChangeRecord) -> BillingResult<()> {
        let mut records = lock(&self.records);
        if !records.iter().any(|r| r.id == record.id) {
            records.push(record.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<Vec<LedgerRecord>>,
}

impl InMemoryLedger {
    pub fn with_records(records: Vec<LedgerRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl BillingLedgerRepo for InMemoryLedger {
    async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<LedgerRecord>> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}
