//! Billing event bus
//!
//! Mutations are synchronized to the display layer through explicit
//! refresh events, never by assuming a provider call resolves
//! synchronously. External consumers (the billing-history widget, the
//! SSE route) subscribe; emission is fire-and-forget.

use serde::Serialize;
use tokio::sync::broadcast;

/// Events observable by external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum BillingEvent {
    /// A plan change committed successfully.
    PlanChangeCompleted,
    /// Billing history should be re-fetched; the reconciler's
    /// de-duplication makes redundant re-fetches safe.
    BillingHistoryUpdated,
    /// Cached billing history must be discarded entirely (e.g. after a
    /// resync rewrote local state).
    InvalidateBillingHistory,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BillingEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A send error only means nobody is listening,
    /// which must never fail the mutation that triggered it.
    pub fn emit(&self, event: BillingEvent) {
        tracing::debug!(event = ?event, "Emitting billing event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
