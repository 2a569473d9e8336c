//! Billing HTTP routes
//!
//! The UI talks to the billing subsystem exclusively through these
//! endpoints. User identity arrives in the `x-user-id` header;
//! authentication itself is handled upstream of this service.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use quotekit_billing::{
    CommitOutcome, HistoryPage, HistoryQuery, InvoiceDownload, ProrationPreview, ResyncOutcome,
};
use quotekit_shared::{PaymentMethod, Subscription};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/billing/payment-methods", get(list_payment_methods))
        .route(
            "/billing/payment-methods/{id}/default",
            post(set_default_payment_method),
        )
        .route("/billing/payment-methods/{id}", delete(delete_payment_method))
        .route("/billing/plan-change/preview", post(preview_plan_change))
        .route("/billing/plan-change", post(commit_plan_change))
        .route("/billing/subscription/cancel", post(cancel_subscription))
        .route(
            "/billing/subscription/reactivate",
            post(reactivate_subscription),
        )
        .route("/billing/history", get(billing_history))
        .route("/billing/invoices/{id}", get(download_invoice))
        .route("/billing/resync", post(resync))
        .route("/billing/events", get(billing_events))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn require_user(headers: &HeaderMap) -> ApiResult<Uuid> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(ApiError::Unauthorized)
}

/// The user's provider customer reference, if they have one. Free
/// accounts legitimately have none.
async fn customer_for(state: &AppState, user_id: Uuid) -> ApiResult<Option<String>> {
    Ok(state
        .billing
        .subscriptions
        .current(user_id)
        .await?
        .provider_customer_id)
}

// =============================================================================
// Payment Methods
// =============================================================================

#[derive(Debug, Serialize)]
struct PaymentMethodView {
    #[serde(flatten)]
    method: PaymentMethod,
    /// Human-readable validation issue (e.g. expiry), if any. Flagged
    /// methods stay listed; they are only barred from charging.
    issue: Option<String>,
}

async fn list_payment_methods(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<PaymentMethodView>>> {
    let user_id = require_user(&headers)?;

    let Some(customer_id) = customer_for(&state, user_id).await? else {
        return Ok(Json(Vec::new()));
    };

    let (methods, issues) = state
        .billing
        .payment_methods
        .list_validated(&customer_id)
        .await?;

    let views = methods
        .into_iter()
        .map(|method| PaymentMethodView {
            issue: issues.get(&method.id).map(|i| i.to_string()),
            method,
        })
        .collect();
    Ok(Json(views))
}

async fn set_default_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_method_id): Path<String>,
) -> ApiResult<StatusCode> {
    let user_id = require_user(&headers)?;
    let customer_id = customer_for(&state, user_id).await?.ok_or_else(|| {
        ApiError::BadRequest("account has no payment provider customer".to_string())
    })?;

    state
        .billing
        .payment_methods
        .set_default(&customer_id, &payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_method_id): Path<String>,
) -> ApiResult<StatusCode> {
    let user_id = require_user(&headers)?;
    let customer_id = customer_for(&state, user_id).await?.ok_or_else(|| {
        ApiError::BadRequest("account has no payment provider customer".to_string())
    })?;

    state
        .billing
        .payment_methods
        .delete(&customer_id, &payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Plan Changes
// =============================================================================

#[derive(Debug, Deserialize)]
struct PreviewBody {
    price_id: String,
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    is_upgrade: bool,
    /// None when the preview is unavailable (free fallback, provider
    /// hiccup); the UI disables the preview panel instead of erroring.
    preview: Option<ProrationPreview>,
}

async fn preview_plan_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PreviewBody>,
) -> ApiResult<Json<PreviewResponse>> {
    let user_id = require_user(&headers)?;
    let subscription = state.billing.subscriptions.current(user_id).await?;

    let mut session = state.billing.plan_changes.open(user_id, subscription);
    state
        .billing
        .plan_changes
        .select_candidate(&mut session, &body.price_id)
        .await?;

    Ok(Json(PreviewResponse {
        is_upgrade: session.intent().map(|i| i.is_upgrade).unwrap_or(false),
        preview: session.preview().cloned(),
    }))
}

#[derive(Debug, Deserialize)]
struct PlanChangeBody {
    price_id: String,
    payment_method_id: Option<String>,
}

async fn commit_plan_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PlanChangeBody>,
) -> ApiResult<Json<CommitOutcome>> {
    let user_id = require_user(&headers)?;
    let subscription = state.billing.subscriptions.current(user_id).await?;

    let mut session = state.billing.plan_changes.open(user_id, subscription);
    state
        .billing
        .plan_changes
        .begin_selection(&mut session, &body.price_id)?;
    if let Some(payment_method_id) = &body.payment_method_id {
        state
            .billing
            .plan_changes
            .select_payment_method(&mut session, payment_method_id);
    }

    let outcome = state.billing.plan_changes.commit(&mut session).await?;
    Ok(Json(outcome))
}

// =============================================================================
// Subscription Lifecycle
// =============================================================================

#[derive(Debug, Deserialize)]
struct CancelBody {
    cancel_at_period_end: Option<bool>,
}

async fn cancel_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<Subscription>> {
    let user_id = require_user(&headers)?;
    let at_period_end = body
        .and_then(|Json(b)| b.cancel_at_period_end)
        .unwrap_or(true);

    let updated = state
        .billing
        .subscriptions
        .cancel(user_id, at_period_end)
        .await?;
    Ok(Json(updated))
}

async fn reactivate_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Subscription>> {
    let user_id = require_user(&headers)?;
    let updated = state.billing.subscriptions.reactivate(user_id).await?;
    Ok(Json(updated))
}

// =============================================================================
// Billing History
// =============================================================================

async fn billing_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryPage>> {
    let user_id = require_user(&headers)?;
    let customer_id = customer_for(&state, user_id).await?;

    let page = state
        .billing
        .history
        .get_history(user_id, customer_id.as_deref(), &query)
        .await?;
    Ok(Json(page))
}

async fn download_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(invoice_id): Path<String>,
) -> ApiResult<Json<InvoiceDownload>> {
    require_user(&headers)?;
    let download = state.billing.history.invoice_download(&invoice_id).await?;
    Ok(Json(download))
}

// =============================================================================
// Sync Recovery
// =============================================================================

async fn resync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ResyncOutcome>> {
    let user_id = require_user(&headers)?;
    let outcome = state.billing.sync.resync(user_id).await?;
    Ok(Json(outcome))
}

// =============================================================================
// Events (SSE)
// =============================================================================

/// Live stream of billing events. The UI subscribes once per page and
/// refreshes the relevant widgets on each event.
async fn billing_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.billing.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        // Lagged receivers just skip ahead; missed refresh events are
        // harmless because the next one carries the same meaning.
        let event = result.ok()?;
        let sse = Event::default().json_data(&event).ok()?;
        Some(Ok(sse))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
