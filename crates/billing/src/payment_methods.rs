//! Payment method listing, validation, and default selection
//!
//! Instruments are created externally via tokenization; this store
//! lists them, flags expired cards, picks the default candidate for a
//! plan-change dialog, and guards deletion of the sole default.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use time::Date;

use quotekit_shared::PaymentMethod;

use crate::error::{BillingError, BillingResult};
use crate::provider::PaymentProvider;

/// Why a payment method cannot be charged. Flagged methods are still
/// shown with a visible error; they are only excluded from default
/// selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentMethodIssue {
    Expired { exp_month: u8, exp_year: i32 },
}

impl std::fmt::Display for PaymentMethodIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethodIssue::Expired {
                exp_month,
                exp_year,
            } => write!(f, "Card expired {:02}/{}", exp_month, exp_year),
        }
    }
}

/// Flag methods whose expiry has passed relative to `today`.
///
/// A card expiring this month is still usable; it only expires once
/// the month is over.
pub fn validate(methods: &[PaymentMethod], today: Date) -> HashMap<String, PaymentMethodIssue> {
    let (year, month) = (today.year(), u8::from(today.month()));
    methods
        .iter()
        .filter(|m| m.exp_year < year || (m.exp_year == year && m.exp_month < month))
        .map(|m| {
            (
                m.id.clone(),
                PaymentMethodIssue::Expired {
                    exp_month: m.exp_month,
                    exp_year: m.exp_year,
                },
            )
        })
        .collect()
}

/// Default-selection policy: prefer the method flagged `is_default`
/// among valid methods, else the first valid method, else none (the
/// caller falls into its "add payment method" branch).
pub fn select_default<'a>(
    methods: &'a [PaymentMethod],
    issues: &HashMap<String, PaymentMethodIssue>,
) -> Option<&'a PaymentMethod> {
    let mut valid = methods.iter().filter(|m| !issues.contains_key(&m.id));
    let first_valid = valid.next()?;
    methods
        .iter()
        .find(|m| m.is_default && !issues.contains_key(&m.id))
        .or(Some(first_valid))
}

/// Fetches and caches the customer's stored payment instruments.
///
/// The cache is keyed by customer id and invalidated explicitly after
/// any mutation or on retry; there is no cross-user state.
pub struct PaymentMethodStore {
    provider: Arc<dyn PaymentProvider>,
    cache: Mutex<HashMap<String, Vec<PaymentMethod>>>,
}

impl PaymentMethodStore {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_get(&self, customer_id: &str) -> Option<Vec<PaymentMethod>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(customer_id).cloned()
    }

    fn cache_put(&self, customer_id: &str, methods: Vec<PaymentMethod>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(customer_id.to_string(), methods);
    }

    /// Drop the cached listing so the next read hits the provider.
    pub fn invalidate(&self, customer_id: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(customer_id);
    }

    /// List the customer's payment methods, serving from cache when
    /// available. An empty list is a valid result.
    pub async fn list(&self, customer_id: &str) -> BillingResult<Vec<PaymentMethod>> {
        if let Some(cached) = self.cache_get(customer_id) {
            return Ok(cached);
        }
        self.refresh(customer_id).await
    }

    /// Re-fetch from the provider, replacing the cached listing.
    pub async fn refresh(&self, customer_id: &str) -> BillingResult<Vec<PaymentMethod>> {
        let methods = self.provider.list_payment_methods(customer_id).await?;
        tracing::debug!(
            customer_id = %customer_id,
            method_count = methods.len(),
            "Refreshed payment methods"
        );
        self.cache_put(customer_id, methods.clone());
        Ok(methods)
    }

    /// List with expiry issues computed against today's date.
    pub async fn list_validated(
        &self,
        customer_id: &str,
    ) -> BillingResult<(Vec<PaymentMethod>, HashMap<String, PaymentMethodIssue>)> {
        let methods = self.list(customer_id).await?;
        let issues = validate(&methods, time::OffsetDateTime::now_utc().date());
        Ok((methods, issues))
    }

    pub async fn set_default(&self, customer_id: &str, payment_method_id: &str) -> BillingResult<()> {
        self.provider
            .set_default_payment_method(customer_id, payment_method_id)
            .await?;
        self.invalidate(customer_id);
        Ok(())
    }

    /// Delete a payment method.
    ///
    /// Deleting the sole default while other methods exist is rejected
    /// with `CannotDeleteOnlyDefault`: the user must promote another
    /// card first so recurring charges keep a payable default. Deleting
    /// the only method on file is permitted.
    pub async fn delete(&self, customer_id: &str, payment_method_id: &str) -> BillingResult<()> {
        let methods = self.list(customer_id).await?;
        let target = methods
            .iter()
            .find(|m| m.id == payment_method_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment method {}", payment_method_id)))?;

        if target.is_default && methods.len() > 1 {
            return Err(BillingError::CannotDeleteOnlyDefault);
        }

        self.provider
            .delete_payment_method(customer_id, payment_method_id)
            .await?;
        self.invalidate(customer_id);

        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Deleted payment method"
        );
        Ok(())
    }
}
