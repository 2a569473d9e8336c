// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Plan Changes and Billing Display
//!
//! Tests critical boundary conditions and race conditions in:
//! - Plan change orchestration (upgrade gate, downgrade bypass, commit)
//! - Stale proration previews arriving out of order
//! - Checkout redirect hand-off vs. real failures
//! - Payment method deletion guards and cache invalidation
//! - Sync recovery idempotence
//! - Webhook-lag history refresh scheduling

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use quotekit_shared::{
    BillingInterval, PaymentMethod, Price, Subscription, SubscriptionStatus,
};

use crate::catalog::PricingCatalog;
use crate::error::{BillingError, ValidationError};
use crate::events::BillingEvent;
use crate::mocks::{InMemoryPlanChangeLog, InMemorySubscriptionRepo, MockProvider};
use crate::payment_methods::PaymentMethodStore;
use crate::plan_change::{CommitOutcome, PlanChangeOrchestrator, PlanChangeState};
use crate::provider::{PlanChangeOutcome, ProrationPreview};
use crate::sync::SyncRecoveryService;

fn price(id: &str, amount_cents: i64) -> Price {
    Price {
        id: id.to_string(),
        amount_cents,
        interval: BillingInterval::Month,
        product_name: id.to_string(),
        description: None,
    }
}

fn catalog() -> PricingCatalog {
    PricingCatalog::new(vec![
        price("price_basic", 1000),
        price("price_pro", 5000),
        price("price_max", 9000),
    ])
}

fn method(id: &str, exp_year: i32, is_default: bool) -> PaymentMethod {
    PaymentMethod {
        id: id.to_string(),
        brand: "visa".to_string(),
        last4: "4242".to_string(),
        exp_month: 1,
        exp_year,
        funding: "credit".to_string(),
        is_default,
        customer_id: "cus_1".to_string(),
    }
}

fn paid_subscription(price_id: &str) -> Subscription {
    Subscription {
        provider_subscription_id: Some("sub_1".to_string()),
        provider_customer_id: Some("cus_1".to_string()),
        price_id: Some(price_id.to_string()),
        status: SubscriptionStatus::Active,
        current_period_start: None,
        current_period_end: None,
        cancel_at_period_end: false,
    }
}

fn preview(immediate: i64) -> ProrationPreview {
    ProrationPreview {
        immediate_total_cents: immediate,
        proration_amount_cents: immediate - 1000,
        next_invoice_total_cents: 5000,
        currency: "usd".to_string(),
    }
}

struct Harness {
    provider: Arc<MockProvider>,
    orchestrator: PlanChangeOrchestrator,
    events: crate::events::EventBus,
}

fn harness(provider: MockProvider) -> Harness {
    let provider = Arc::new(provider);
    let events = crate::events::EventBus::new();
    let orchestrator = PlanChangeOrchestrator::new(
        provider.clone(),
        Arc::new(PaymentMethodStore::new(provider.clone())),
        catalog(),
        Arc::new(InMemoryPlanChangeLog::default()),
        Arc::new(InMemorySubscriptionRepo::default()),
        events.clone(),
    )
    .with_refresh_delays([Duration::from_millis(1), Duration::from_millis(2)]);
    Harness {
        provider,
        orchestrator,
        events,
    }
}

mod plan_change_gate_tests {
    use super::*;

    // =========================================================================
    // Downgrade: no proration preview, no payment validation, commits
    // directly with effect at period end
    // =========================================================================
    #[tokio::test]
    async fn downgrade_skips_preview_and_payment_gate() {
        let h = harness(MockProvider::default());
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_pro"));

        let request = h
            .orchestrator
            .begin_selection(&mut session, "price_basic")
            .unwrap();
        assert!(request.is_none(), "downgrades must not request a preview");
        assert_eq!(session.state(), PlanChangeState::SelectingPlan);

        let outcome = h.orchestrator.commit(&mut session).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Completed { .. }));
        assert_eq!(session.state(), PlanChangeState::Succeeded);

        assert_eq!(h.provider.preview_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.provider.list_method_calls.load(Ordering::SeqCst),
            0,
            "downgrade commit must not run the payment gate"
        );
    }

    // =========================================================================
    // Upgrade with zero payment methods on file - blocked before the
    // provider is ever asked to change anything
    // =========================================================================
    #[tokio::test]
    async fn upgrade_without_payment_methods_is_blocked() {
        let h = harness(MockProvider::default());
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();

        let err = h.orchestrator.commit(&mut session).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::Validation(ValidationError::NoPaymentMethods)
        ));
        assert_eq!(session.state(), PlanChangeState::SelectingPlan);
        assert!(session.last_error().is_some());
        assert_eq!(h.provider.change_plan_calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Upgrade where the provider-side default card is expired - the
    // valid non-default card is auto-selected instead
    // =========================================================================
    #[tokio::test]
    async fn expired_default_card_is_skipped_at_commit() {
        let h = harness(MockProvider::default().with_payment_methods(vec![
            method("pm_expired_default", 2020, true),
            method("pm_valid", 2040, false),
        ]));
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();

        let outcome = h.orchestrator.commit(&mut session).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Completed { .. }));
        assert_eq!(
            session.intent().unwrap().payment_method_id.as_deref(),
            Some("pm_valid")
        );
    }

    // =========================================================================
    // Explicitly selecting an expired card - blocked with a distinct
    // violation message
    // =========================================================================
    #[tokio::test]
    async fn selected_expired_card_is_rejected() {
        let h = harness(MockProvider::default().with_payment_methods(vec![
            method("pm_expired", 2020, false),
            method("pm_valid", 2040, true),
        ]));
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();
        h.orchestrator
            .select_payment_method(&mut session, "pm_expired");

        let err = h.orchestrator.commit(&mut session).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::Validation(ValidationError::PaymentMethodExpired)
        ));
        assert_eq!(h.provider.change_plan_calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Commit with no candidate selected
    // =========================================================================
    #[tokio::test]
    async fn commit_without_candidate_is_rejected() {
        let h = harness(MockProvider::default());
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        let err = h.orchestrator.commit(&mut session).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::Validation(ValidationError::MissingCandidatePlan)
        ));
    }
}

mod preview_race_tests {
    use super::*;

    // =========================================================================
    // Preview response for a superseded selection arrives after the
    // user already switched candidates - it must be discarded
    // =========================================================================
    #[tokio::test]
    async fn stale_preview_is_discarded() {
        let h = harness(MockProvider::default());
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        let first = h
            .orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap()
            .unwrap();
        let second = h
            .orchestrator
            .begin_selection(&mut session, "price_max")
            .unwrap()
            .unwrap();

        // First response lands late, after the switch to price_max.
        h.orchestrator
            .apply_preview(&mut session, first, Ok(preview(4000)));
        assert!(
            session.preview().is_none(),
            "stale preview must not be applied"
        );

        h.orchestrator
            .apply_preview(&mut session, second, Ok(preview(8000)));
        assert_eq!(session.preview().unwrap().immediate_total_cents, 8000);
        assert_eq!(session.state(), PlanChangeState::SelectingPlan);
    }

    // =========================================================================
    // Preview response arriving after the dialog was dismissed
    // =========================================================================
    #[tokio::test]
    async fn preview_after_close_is_discarded() {
        let h = harness(MockProvider::default());
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        let request = h
            .orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap()
            .unwrap();
        h.orchestrator.close(&mut session);

        h.orchestrator
            .apply_preview(&mut session, request, Ok(preview(4000)));
        assert!(session.preview().is_none());
        assert_eq!(session.state(), PlanChangeState::Idle);
    }

    // =========================================================================
    // Preview unavailable (free fallback has nothing to prorate) - the
    // flow continues without a preview panel instead of erroring out
    // =========================================================================
    #[tokio::test]
    async fn unavailable_preview_is_non_blocking() {
        let h = harness(MockProvider::default());
        let mut session = h.orchestrator.open(Uuid::new_v4(), Subscription::free());

        // MockProvider has no preview configured; the fetch fails with
        // PreviewUnavailable, which select_candidate absorbs.
        h.orchestrator
            .select_candidate(&mut session, "price_pro")
            .await
            .unwrap();
        assert!(session.preview().is_none());
        assert_eq!(session.state(), PlanChangeState::SelectingPlan);
        assert!(session.intent().is_some());
    }

    // =========================================================================
    // Switching candidates preserves the payment-method choice but
    // drops the now-wrong preview
    // =========================================================================
    #[tokio::test]
    async fn candidate_switch_keeps_payment_method_drops_preview() {
        let h = harness(MockProvider::default().with_preview(preview(4000)));
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .select_candidate(&mut session, "price_pro")
            .await
            .unwrap();
        h.orchestrator
            .select_payment_method(&mut session, "pm_valid");

        h.orchestrator
            .begin_selection(&mut session, "price_max")
            .unwrap();
        let intent = session.intent().unwrap();
        assert_eq!(intent.candidate_price_id, "price_max");
        assert_eq!(intent.payment_method_id.as_deref(), Some("pm_valid"));
        assert!(session.preview().is_none());
    }
}

mod commit_outcome_tests {
    use super::*;

    // =========================================================================
    // Free-to-paid hand-off: the provider answers with a checkout URL.
    // This is a control signal, not a failure.
    // =========================================================================
    #[tokio::test]
    async fn checkout_redirect_is_not_a_failure() {
        let h = harness(MockProvider::default().with_change_plan_outcome(
            PlanChangeOutcome::Redirect {
                checkout_url: "https://checkout.test/session_1".to_string(),
            },
        ));
        let mut session = h.orchestrator.open(Uuid::new_v4(), Subscription::free());

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();

        let outcome = h.orchestrator.commit(&mut session).await.unwrap();
        match outcome {
            CommitOutcome::Redirect { checkout_url } => {
                assert_eq!(checkout_url, "https://checkout.test/session_1");
            }
            CommitOutcome::Completed { .. } => panic!("expected redirect"),
        }
        assert_ne!(session.state(), PlanChangeState::Failed);
        assert!(session.last_error().is_none());
        // Free accounts have no provider subscription, so the payment
        // gate never ran.
        assert_eq!(h.provider.list_method_calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Provider failure during commit: Failed state with a message, and
    // acknowledging it returns to selection with the candidate intact
    // =========================================================================
    #[tokio::test]
    async fn failure_retains_candidate_for_retry() {
        let h = harness(
            MockProvider::default()
                .with_payment_methods(vec![method("pm_valid", 2040, true)])
                .failing_change_plan("card declined"),
        );
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();

        let err = h.orchestrator.commit(&mut session).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderUnavailable(_)));
        assert_eq!(session.state(), PlanChangeState::Failed);
        assert!(session.last_error().unwrap().contains("card declined"));

        h.orchestrator.acknowledge_failure(&mut session);
        assert_eq!(session.state(), PlanChangeState::SelectingPlan);
        assert!(session.last_error().is_none());
        assert_eq!(
            session.intent().unwrap().candidate_price_id,
            "price_pro",
            "retry must not force re-picking the plan"
        );
    }

    // =========================================================================
    // Provider outage while the payment gate fetches cards: the dialog
    // must not be stranded mid-validation. It lands in Failed with the
    // error surfaced, and acknowledging recovers it like any other
    // failed commit.
    // =========================================================================
    #[tokio::test]
    async fn payment_method_outage_during_commit_is_recoverable() {
        let h = harness(MockProvider::default().failing_payment_methods("provider down"));
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();

        let err = h.orchestrator.commit(&mut session).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderUnavailable(_)));
        assert_eq!(session.state(), PlanChangeState::Failed);
        assert!(session.last_error().unwrap().contains("provider down"));
        assert_eq!(h.provider.change_plan_calls.load(Ordering::SeqCst), 0);

        h.orchestrator.acknowledge_failure(&mut session);
        assert_eq!(session.state(), PlanChangeState::SelectingPlan);
        assert!(session.last_error().is_none());
        assert_eq!(session.intent().unwrap().candidate_price_id, "price_pro");
    }

    // =========================================================================
    // Successful commit records the change and schedules the immediate
    // plus two delayed history refreshes
    // =========================================================================
    #[tokio::test]
    async fn commit_schedules_webhook_lag_refreshes() {
        let h = harness(
            MockProvider::default().with_payment_methods(vec![method("pm_valid", 2040, true)]),
        );
        let mut rx = h.events.subscribe();
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));

        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();
        h.orchestrator.commit(&mut session).await.unwrap();

        // Give the delayed re-checks (1ms and 2ms in this harness) time
        // to fire.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut completed = 0;
        let mut refreshes = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                BillingEvent::PlanChangeCompleted => completed += 1,
                BillingEvent::BillingHistoryUpdated => refreshes += 1,
                BillingEvent::InvalidateBillingHistory => {}
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(refreshes, 3, "immediate refresh plus two re-checks");
    }

    // =========================================================================
    // Commit on a closed dialog
    // =========================================================================
    #[tokio::test]
    async fn commit_after_close_is_rejected() {
        let h = harness(MockProvider::default());
        let mut session = h
            .orchestrator
            .open(Uuid::new_v4(), paid_subscription("price_basic"));
        h.orchestrator
            .begin_selection(&mut session, "price_pro")
            .unwrap();
        h.orchestrator.close(&mut session);

        assert!(h.orchestrator.commit(&mut session).await.is_err());
        assert_eq!(h.provider.change_plan_calls.load(Ordering::SeqCst), 0);
    }
}

mod payment_method_store_tests {
    use super::*;

    // =========================================================================
    // Deleting the default while other cards exist - rejected so
    // recurring charges keep a payable default
    // =========================================================================
    #[tokio::test]
    async fn deleting_default_among_others_is_rejected() {
        let provider = Arc::new(MockProvider::default().with_payment_methods(vec![
            method("pm_default", 2040, true),
            method("pm_other", 2040, false),
        ]));
        let store = PaymentMethodStore::new(provider);

        let err = store.delete("cus_1", "pm_default").await.unwrap_err();
        assert!(matches!(err, BillingError::CannotDeleteOnlyDefault));
    }

    // =========================================================================
    // Deleting the only card on file is permitted
    // =========================================================================
    #[tokio::test]
    async fn deleting_sole_method_is_permitted() {
        let provider =
            Arc::new(MockProvider::default().with_payment_methods(vec![method(
                "pm_only",
                2040,
                true,
            )]));
        let store = PaymentMethodStore::new(provider);

        store.delete("cus_1", "pm_only").await.unwrap();
        assert!(store.list("cus_1").await.unwrap().is_empty());
    }

    // =========================================================================
    // Deleting a non-default card invalidates the cache so the next
    // read reflects the removal
    // =========================================================================
    #[tokio::test]
    async fn delete_invalidates_cached_listing() {
        let provider = Arc::new(MockProvider::default().with_payment_methods(vec![
            method("pm_default", 2040, true),
            method("pm_other", 2040, false),
        ]));
        let store = PaymentMethodStore::new(provider.clone());

        assert_eq!(store.list("cus_1").await.unwrap().len(), 2);
        store.delete("cus_1", "pm_other").await.unwrap();
        assert_eq!(store.list("cus_1").await.unwrap().len(), 1);
        assert!(provider.list_method_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn deleting_unknown_method_is_not_found() {
        let provider = Arc::new(MockProvider::default());
        let store = PaymentMethodStore::new(provider);
        assert!(matches!(
            store.delete("cus_1", "pm_missing").await.unwrap_err(),
            BillingError::NotFound(_)
        ));
    }
}

mod history_service_tests {
    use super::*;
    use time::OffsetDateTime;

    use crate::history::{BillingHistoryService, HistoryQuery};
    use crate::ledger::{LedgerRecord, PlanChangeRecord};
    use crate::mocks::InMemoryLedger;
    use crate::provider::ProviderInvoice;

    fn at(ts: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(ts).unwrap()
    }

    // =========================================================================
    // All three sources appear in one merged view; dropping the
    // customer reference drops only the provider invoices
    // =========================================================================
    #[tokio::test]
    async fn history_merges_all_three_sources() {
        let user_id = Uuid::new_v4();
        let provider = Arc::new(MockProvider::default().with_invoices(vec![ProviderInvoice {
            id: "in_1".to_string(),
            created: at(1_700_000_300),
            amount_cents: 5000,
            status: "paid".to_string(),
            hosted_url: Some("https://invoices.test/in_1".to_string()),
            description: "Pro plan".to_string(),
        }]));
        let ledger = Arc::new(InMemoryLedger::with_records(vec![LedgerRecord {
            id: "led_1".to_string(),
            user_id,
            amount_cents: -500,
            status: "credited".to_string(),
            description: "Manual credit".to_string(),
            created_at: at(1_700_000_200),
        }]));
        let changes = Arc::new(InMemoryPlanChangeLog::with_records(vec![PlanChangeRecord {
            id: "chg_1".to_string(),
            user_id,
            from_price_id: Some("price_basic".to_string()),
            to_price_id: "price_pro".to_string(),
            amount_cents: 5000,
            status: "completed".to_string(),
            changed_at: at(1_700_000_100),
        }]));

        let service = BillingHistoryService::new(provider, ledger, changes);

        let page = service
            .get_history(user_id, Some("cus_1"), &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        // Canonical order is date descending.
        assert_eq!(page.items[0].id, "in_1");
        assert_eq!(page.items[2].id, "chg_1");

        // Without a provider customer there are no invoices to merge.
        let local_only = service
            .get_history(user_id, None, &HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(local_only.total, 2);
    }

    // =========================================================================
    // Only provider invoices resolve to a download; local-only records
    // are rejected before the provider is asked
    // =========================================================================
    #[tokio::test]
    async fn download_is_rejected_for_local_records() {
        let provider = Arc::new(MockProvider::default());
        let service = BillingHistoryService::new(
            provider,
            Arc::new(InMemoryLedger::default()),
            Arc::new(InMemoryPlanChangeLog::default()),
        );
        assert!(matches!(
            service.invoice_download("chg_1").await.unwrap_err(),
            BillingError::NotFound(_)
        ));
    }
}

mod sync_recovery_tests {
    use super::*;
    use crate::ledger::SubscriptionRepo;

    // =========================================================================
    // Resync writes once, then becomes a no-op: same provider state on
    // a repeat call must not rewrite or re-invalidate anything
    // =========================================================================
    #[tokio::test]
    async fn resync_is_idempotent() {
        let remote = paid_subscription("price_pro");
        let provider = Arc::new(MockProvider::default().with_subscription(remote.clone()));
        let repo = Arc::new(InMemorySubscriptionRepo::default());
        let events = crate::events::EventBus::new();
        let mut rx = events.subscribe();

        let user_id = Uuid::new_v4();
        // Local snapshot is stale: still on the old price.
        repo.replace(user_id, Some(&paid_subscription("price_basic")))
            .await
            .unwrap();

        let sync = SyncRecoveryService::new(provider, repo.clone(), events);

        let first = sync.resync(user_id).await.unwrap();
        assert!(first.changed);
        assert_eq!(
            repo.get(user_id).await.unwrap().unwrap().price_id.as_deref(),
            Some("price_pro")
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            BillingEvent::InvalidateBillingHistory
        );

        let second = sync.resync(user_id).await.unwrap();
        assert!(!second.changed);
        assert!(rx.try_recv().is_err(), "no-op resync must not emit");
    }

    // =========================================================================
    // Provider has no subscription for the customer - local snapshot is
    // cleared and the account reads back as the free fallback
    // =========================================================================
    #[tokio::test]
    async fn resync_reverts_to_free_when_provider_has_nothing() {
        let provider = Arc::new(MockProvider::default());
        let repo = Arc::new(InMemorySubscriptionRepo::default());
        let user_id = Uuid::new_v4();
        repo.replace(user_id, Some(&paid_subscription("price_pro")))
            .await
            .unwrap();

        let sync = SyncRecoveryService::new(provider, repo.clone(), crate::events::EventBus::new());
        let outcome = sync.resync(user_id).await.unwrap();
        assert!(outcome.changed);
        assert!(repo.get(user_id).await.unwrap().is_none());
    }
}
