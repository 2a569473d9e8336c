//! Price catalog
//!
//! Immutable reference data. The catalog classifies a candidate price
//! as an upgrade or downgrade by strict amount comparison against the
//! current plan; the free fallback counts as zero.

use sqlx::PgPool;

use quotekit_shared::{BillingInterval, Price, Subscription};

use crate::error::{BillingResult, ValidationError};

#[derive(Debug, Clone)]
pub struct PricingCatalog {
    prices: Vec<Price>,
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    id: String,
    amount_cents: i64,
    interval: String,
    product_name: String,
    description: Option<String>,
}

impl PricingCatalog {
    pub fn new(prices: Vec<Price>) -> Self {
        Self { prices }
    }

    /// Load the catalog from the `prices` table.
    pub async fn load(pool: &PgPool) -> BillingResult<Self> {
        let rows: Vec<PriceRow> = sqlx::query_as(
            "SELECT id, amount_cents, interval, product_name, description FROM prices ORDER BY amount_cents",
        )
        .fetch_all(pool)
        .await?;

        let prices = rows
            .into_iter()
            .map(|row| Price {
                id: row.id,
                amount_cents: row.amount_cents,
                interval: if row.interval == "year" {
                    BillingInterval::Year
                } else {
                    BillingInterval::Month
                },
                product_name: row.product_name,
                description: row.description,
            })
            .collect::<Vec<_>>();

        tracing::info!(price_count = prices.len(), "Loaded price catalog");
        Ok(Self::new(prices))
    }

    pub fn get(&self, price_id: &str) -> Option<&Price> {
        self.prices.iter().find(|p| p.id == price_id)
    }

    pub fn require(&self, price_id: &str) -> Result<&Price, ValidationError> {
        self.get(price_id)
            .ok_or_else(|| ValidationError::UnknownPrice(price_id.to_string()))
    }

    pub fn prices(&self) -> &[Price] {
        &self.prices
    }

    /// Amount of the subscription's current plan; the free fallback
    /// and unknown prices count as zero.
    pub fn current_amount(&self, subscription: &Subscription) -> i64 {
        subscription
            .price_id
            .as_deref()
            .and_then(|id| self.get(id))
            .map(|p| p.amount_cents)
            .unwrap_or(0)
    }

    /// Strictly-greater amount is an upgrade; equal or less is a
    /// downgrade and takes effect at period end.
    pub fn is_upgrade(&self, subscription: &Subscription, candidate: &Price) -> bool {
        candidate.amount_cents > self.current_amount(subscription)
    }
}
