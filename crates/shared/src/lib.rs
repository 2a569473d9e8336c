#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared domain types for QuoteKit.
//!
//! Types that cross crate boundaries live here: the subscription and
//! payment-method models owned by the billing subsystem, the immutable
//! price catalog entries, and the Postgres pool helper.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    BillingInterval, PaymentMethod, Price, Subscription, SubscriptionStatus,
};
