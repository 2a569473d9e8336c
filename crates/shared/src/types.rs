//! Core billing domain types

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Subscription lifecycle status as displayed to the account owner.
///
/// `Free` is the fallback plan for accounts without a provider-side
/// subscription; it is a real state here, not an absence of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Free,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Free => "free",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "free" => Some(SubscriptionStatus::Free),
            _ => None,
        }
    }

    /// Statuses that count as a live paid subscription.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing interval for a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }
}

/// The user's subscription as this subsystem sees it.
///
/// `provider_subscription_id` and `provider_customer_id` are `None`
/// for accounts on the free fallback plan; every paid status carries
/// both. Mutated only through the plan-change orchestrator or a
/// provider resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl Subscription {
    /// The free fallback plan shown when no provider subscription exists.
    pub fn free() -> Self {
        Self {
            provider_subscription_id: None,
            provider_customer_id: None,
            price_id: None,
            status: SubscriptionStatus::Free,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == SubscriptionStatus::Free || self.provider_subscription_id.is_none()
    }
}

/// A stored payment instrument, created externally via tokenization.
///
/// This subsystem only lists, flags, defaults, and deletes methods; it
/// never creates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub brand: String,
    pub last4: String,
    pub exp_month: u8,
    pub exp_year: i32,
    pub funding: String,
    pub is_default: bool,
    pub customer_id: String,
}

/// Immutable price catalog entry. Amounts are integer minor-currency
/// units (cents); never mutated by this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    pub amount_cents: i64,
    pub interval: BillingInterval,
    pub product_name: String,
    pub description: Option<String>,
}
