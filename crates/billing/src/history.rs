//! Billing history reconciliation
//!
//! Three sources of billing truth feed one display collection:
//! provider invoices, the local plan-change log, and local billing
//! ledger rows. The merge is a pure function (no I/O) keyed by id with
//! provider invoices winning duplicate ids, so repeated refreshes are
//! idempotent and webhook-lagged re-fetches can never duplicate rows.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{BillingLedgerRepo, LedgerRecord, PlanChangeLogRepo, PlanChangeRecord};
use crate::provider::{InvoiceDownload, PaymentProvider, ProviderInvoice};

/// Id prefix the provider stamps on its invoices. Entries matching it
/// are downloadable even without a hosted URL.
pub const PROVIDER_INVOICE_PREFIX: &str = "in_";

/// Which source a history entry is displayed from. Declaration order
/// is display priority: when two sources report the same id, the
/// lower-ranked variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySource {
    ProviderInvoice,
    SubscriptionChange,
    LedgerRecord,
}

/// Unified, read-only history projection. Regenerated on every fetch,
/// never stored as mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingHistoryRecord {
    pub id: String,
    pub date: OffsetDateTime,
    pub amount_cents: i64,
    pub status: String,
    pub invoice_url: Option<String>,
    pub description: String,
    pub source: HistorySource,
}

impl BillingHistoryRecord {
    /// Whether a download can be offered. Anything else renders as
    /// "no invoice" instead of a dead link.
    pub fn has_invoice(&self) -> bool {
        self.id.starts_with(PROVIDER_INVOICE_PREFIX)
            || self
                .invoice_url
                .as_deref()
                .is_some_and(|url| url.starts_with("http://") || url.starts_with("https://"))
    }
}

impl From<ProviderInvoice> for BillingHistoryRecord {
    fn from(inv: ProviderInvoice) -> Self {
        Self {
            id: inv.id,
            date: inv.created,
            amount_cents: inv.amount_cents,
            status: inv.status,
            invoice_url: inv.hosted_url,
            description: inv.description,
            source: HistorySource::ProviderInvoice,
        }
    }
}

impl From<PlanChangeRecord> for BillingHistoryRecord {
    fn from(rec: PlanChangeRecord) -> Self {
        let description = match &rec.from_price_id {
            Some(from) => format!("Plan change from {} to {}", from, rec.to_price_id),
            None => format!("Subscribed to {}", rec.to_price_id),
        };
        Self {
            id: rec.id,
            date: rec.changed_at,
            amount_cents: rec.amount_cents,
            status: rec.status,
            invoice_url: None,
            description,
            source: HistorySource::SubscriptionChange,
        }
    }
}

impl From<LedgerRecord> for BillingHistoryRecord {
    fn from(rec: LedgerRecord) -> Self {
        Self {
            id: rec.id,
            date: rec.created_at,
            amount_cents: rec.amount_cents,
            status: rec.status,
            invoice_url: None,
            description: rec.description,
            source: HistorySource::LedgerRecord,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistorySortField {
    #[default]
    Date,
    Amount,
    Status,
    Description,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Search, filter, sort, and pagination parameters for a history fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    /// Case-insensitive substring match on description or id.
    pub search: Option<String>,
    /// Exact status filter (case-insensitive).
    pub status: Option<String>,
    #[serde(default)]
    pub sort: HistorySortField,
    #[serde(default)]
    pub direction: SortDirection,
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    20
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            search: None,
            status: None,
            sort: HistorySortField::default(),
            direction: SortDirection::default(),
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<BillingHistoryRecord>,
    pub total: usize,
}

/// Merge the three raw sources into one de-duplicated collection.
///
/// Pure function: keyed by id, `provider_invoice` wins duplicate ids
/// (including its status when sources disagree), output canonically
/// ordered by date descending with an id tie-break. Merging the same
/// inputs twice yields the same output.
pub fn reconcile(
    invoices: Vec<ProviderInvoice>,
    changes: Vec<PlanChangeRecord>,
    ledger: Vec<LedgerRecord>,
) -> Vec<BillingHistoryRecord> {
    let mut by_id: HashMap<String, BillingHistoryRecord> = HashMap::new();

    let records = invoices
        .into_iter()
        .map(BillingHistoryRecord::from)
        .chain(changes.into_iter().map(BillingHistoryRecord::from))
        .chain(ledger.into_iter().map(BillingHistoryRecord::from));

    for record in records {
        match by_id.get(&record.id) {
            Some(existing) if existing.source <= record.source => {}
            _ => {
                by_id.insert(record.id.clone(), record);
            }
        }
    }

    let mut merged: Vec<BillingHistoryRecord> = by_id.into_values().collect();
    merged.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
    merged
}

/// Apply search, status filter, sort, and pagination. Sorting is
/// stable with an id tie-break so equal keys keep a deterministic
/// order across refreshes.
pub fn apply_query(records: &[BillingHistoryRecord], query: &HistoryQuery) -> HistoryPage {
    let mut filtered: Vec<BillingHistoryRecord> = records
        .iter()
        .filter(|r| {
            if let Some(search) = &query.search {
                let needle = search.to_lowercase();
                if !r.description.to_lowercase().contains(&needle)
                    && !r.id.to_lowercase().contains(&needle)
                {
                    return false;
                }
            }
            if let Some(status) = &query.status {
                if !r.status.eq_ignore_ascii_case(status) {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect();

    filtered.sort_by(|a, b| {
        let ordering = match query.sort {
            HistorySortField::Date => a.date.cmp(&b.date),
            HistorySortField::Amount => a.amount_cents.cmp(&b.amount_cents),
            HistorySortField::Status => a.status.to_lowercase().cmp(&b.status.to_lowercase()),
            HistorySortField::Description => a
                .description
                .to_lowercase()
                .cmp(&b.description.to_lowercase()),
        };
        let ordering = match query.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    });

    let total = filtered.len();
    let per_page = query.per_page.max(1);
    // Page numbers come straight off the query string; an absurd value
    // must land on an empty page, not overflow the offset.
    let start = query.page.saturating_sub(1).saturating_mul(per_page);
    let items = filtered
        .into_iter()
        .skip(start)
        .take(per_page)
        .collect();

    HistoryPage { items, total }
}

/// Fetches the three sources and serves reconciled, queryable history.
pub struct BillingHistoryService {
    provider: Arc<dyn PaymentProvider>,
    ledger: Arc<dyn BillingLedgerRepo>,
    plan_changes: Arc<dyn PlanChangeLogRepo>,
}

impl BillingHistoryService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        ledger: Arc<dyn BillingLedgerRepo>,
        plan_changes: Arc<dyn PlanChangeLogRepo>,
    ) -> Self {
        Self {
            provider,
            ledger,
            plan_changes,
        }
    }

    /// Fetch, merge, and page the user's billing history. Without a
    /// provider customer reference only the local sources contribute.
    pub async fn get_history(
        &self,
        user_id: Uuid,
        customer_id: Option<&str>,
        query: &HistoryQuery,
    ) -> BillingResult<HistoryPage> {
        let invoices = match customer_id {
            Some(customer) => self.provider.list_invoices(customer).await?,
            None => Vec::new(),
        };
        let changes = self.plan_changes.list_for_user(user_id).await?;
        let ledger = self.ledger.list_for_user(user_id).await?;

        tracing::debug!(
            user_id = %user_id,
            invoices = invoices.len(),
            plan_changes = changes.len(),
            ledger_rows = ledger.len(),
            "Reconciling billing history"
        );

        let merged = reconcile(invoices, changes, ledger);
        Ok(apply_query(&merged, query))
    }

    /// Resolve an invoice download. Ids outside the provider pattern
    /// have no downloadable resource and surface as not found so the
    /// UI shows "no invoice" rather than a dead link.
    pub async fn invoice_download(&self, invoice_id: &str) -> BillingResult<InvoiceDownload> {
        if !invoice_id.starts_with(PROVIDER_INVOICE_PREFIX) {
            return Err(BillingError::NotFound(format!("invoice {}", invoice_id)));
        }
        self.provider.fetch_invoice(invoice_id).await
    }
}
