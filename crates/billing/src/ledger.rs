//! Local billing records
//!
//! Two of the three billing-history sources live here (the billing
//! ledger and the plan-change log) plus the locally cached
//! subscription snapshot that sync recovery repairs. Each store is a
//! trait with a Postgres implementation; tests use in-memory mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use quotekit_shared::{Subscription, SubscriptionStatus};

use crate::error::BillingResult;

/// A locally stored billing event, not necessarily mirrored by a
/// provider invoice (manual credits, imported charges, adjustments).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerRecord {
    pub id: String,
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub status: String,
    pub description: String,
    pub created_at: OffsetDateTime,
}

/// A committed subscription change, written by the orchestrator when a
/// plan change succeeds. The provider's own invoice for the same event
/// usually arrives later via webhook; the reconciler de-duplicates.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanChangeRecord {
    pub id: String,
    pub user_id: Uuid,
    pub from_price_id: Option<String>,
    pub to_price_id: String,
    pub amount_cents: i64,
    pub status: String,
    pub changed_at: OffsetDateTime,
}

#[async_trait]
pub trait BillingLedgerRepo: Send + Sync {
    async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<LedgerRecord>>;
}

#[async_trait]
pub trait PlanChangeLogRepo: Send + Sync {
    async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PlanChangeRecord>>;
    async fn record(&self, record: &PlanChangeRecord) -> BillingResult<()>;
}

/// Local snapshot of the user's subscription. `replace(user, None)`
/// clears the snapshot, which reads back as the free fallback.
#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;
    async fn replace(&self, user_id: Uuid, subscription: Option<&Subscription>)
        -> BillingResult<()>;
}

pub struct PgBillingLedgerRepo {
    pool: PgPool,
}

impl PgBillingLedgerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingLedgerRepo for PgBillingLedgerRepo {
    async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<LedgerRecord>> {
        let records: Vec<LedgerRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount_cents, status, description, created_at
            FROM billing_ledger
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

pub struct PgPlanChangeLogRepo {
    pool: PgPool,
}

impl PgPlanChangeLogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanChangeLogRepo for PgPlanChangeLogRepo {
    async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<PlanChangeRecord>> {
        let records: Vec<PlanChangeRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, from_price_id, to_price_id, amount_cents, status, changed_at
            FROM plan_change_log
            WHERE user_id = $1
            ORDER BY changed_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn record(&self, record: &PlanChangeRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plan_change_log
                (id, user_id, from_price_id, to_price_id, amount_cents, status, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.user_id)
        .bind(&record.from_price_id)
        .bind(&record.to_price_id)
        .bind(record.amount_cents)
        .bind(&record.status)
        .bind(record.changed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    provider_subscription_id: Option<String>,
    provider_customer_id: Option<String>,
    price_id: Option<String>,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
}

pub struct PgSubscriptionRepo {
    pool: PgPool,
}

impl PgSubscriptionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionRepo for PgSubscriptionRepo {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT provider_subscription_id, provider_customer_id, price_id, status,
                   current_period_start, current_period_end, cancel_at_period_end
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Subscription {
            provider_subscription_id: r.provider_subscription_id,
            provider_customer_id: r.provider_customer_id,
            price_id: r.price_id,
            status: SubscriptionStatus::parse(&r.status).unwrap_or(SubscriptionStatus::Free),
            current_period_start: r.current_period_start,
            current_period_end: r.current_period_end,
            cancel_at_period_end: r.cancel_at_period_end,
        }))
    }

    async fn replace(
        &self,
        user_id: Uuid,
        subscription: Option<&Subscription>,
    ) -> BillingResult<()> {
        match subscription {
            Some(sub) => {
                sqlx::query(
                    r#"
                    INSERT INTO subscriptions
                        (user_id, provider_subscription_id, provider_customer_id, price_id,
                         status, current_period_start, current_period_end, cancel_at_period_end,
                         last_synced_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                    ON CONFLICT (user_id) DO UPDATE SET
                        provider_subscription_id = EXCLUDED.provider_subscription_id,
                        provider_customer_id = EXCLUDED.provider_customer_id,
                        price_id = EXCLUDED.price_id,
                        status = EXCLUDED.status,
                        current_period_start = EXCLUDED.current_period_start,
                        current_period_end = EXCLUDED.current_period_end,
                        cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                        last_synced_at = NOW()
                    "#,
                )
                .bind(user_id)
                .bind(&sub.provider_subscription_id)
                .bind(&sub.provider_customer_id)
                .bind(&sub.price_id)
                .bind(sub.status.as_str())
                .bind(sub.current_period_start)
                .bind(sub.current_period_end)
                .bind(sub.cancel_at_period_end)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}
