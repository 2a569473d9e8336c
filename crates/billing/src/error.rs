//! Billing error taxonomy
//!
//! Validation errors are resolved locally and block the state machine;
//! provider errors are surfaced with a retry affordance and never
//! corrupt in-memory selection state. A checkout redirect is NOT an
//! error and therefore does not appear here: it is the `Redirect` arm
//! of [`crate::provider::PlanChangeOutcome`].

use thiserror::Error;

/// Local precondition failure. Never sent to the payment provider.
///
/// Each variant carries its own user-facing message so the dialog can
/// tell "no methods at all" from "none selected" from "selected one
/// expired".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No payment methods on file. Add a card before upgrading.")]
    NoPaymentMethods,

    #[error("Select a payment method to continue with the upgrade.")]
    NoPaymentMethodSelected,

    #[error("The selected card has expired. Choose a different payment method.")]
    PaymentMethodExpired,

    #[error("Select a plan before continuing.")]
    MissingCandidatePlan,

    #[error("Unknown price: {0}")]
    UnknownPrice(String),
}

#[derive(Debug, Error)]
pub enum BillingError {
    /// Network/auth failure talking to the payment provider. Retryable.
    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Proration preview could not be computed (missing subscription or
    /// customer reference). Non-fatal: disables the preview panel only.
    #[error("Proration preview unavailable: {0}")]
    PreviewUnavailable(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Deleting the sole default method while other methods exist would
    /// leave recurring charges with nothing to bill.
    #[error("Cannot delete the only default payment method. Set another card as default first.")]
    CannotDeleteOnlyDefault,

    /// Local subscription view contradicts provider records. Recoverable
    /// via `SyncRecoveryService::resync`.
    #[error("Billing state out of sync: {0}")]
    StateDrift(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ProviderUnavailable(_))
    }

    /// Whether the error should disable a panel rather than block the flow.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, BillingError::PreviewUnavailable(_))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
