//! API error responses
//!
//! Maps billing errors to HTTP statuses. Validation violations are the
//! user's problem (422); provider outages are upstream problems (502);
//! everything unexpected is a 500 with the details kept in the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use quotekit_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid x-user-id header")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

fn billing_status(error: &BillingError) -> StatusCode {
    match error {
        BillingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::CannotDeleteOnlyDefault | BillingError::StateDrift(_) => {
            StatusCode::CONFLICT
        }
        BillingError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
        BillingError::PreviewUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => billing_status(e),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "Request rejected");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
