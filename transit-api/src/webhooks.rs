use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::Redirect,
    Json,
};
use serde::Deserialize;
use transit_order::{BookingError, WebhookOutcome};

use crate::error::AppError;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "X-Gateway-Signature";

/// POST /v1/webhooks/payments
/// The raw body is needed for signature verification, so it is not parsed here.
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state.orchestrator.handle_webhook(signature, &body).await?;
    tracing::info!(outcome = ?outcome, "Payment webhook processed");
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ReturnQuery {
    pub reference: String,
}

/// GET /v1/payments/return?reference=...
/// Browser return from checkout. Re-verifies with the gateway, then sends the
/// customer to the front-end with the resulting status.
pub async fn payment_return(State(state): State<AppState>, Query(query): Query<ReturnQuery>) -> Redirect {
    let base = state.http.return_redirect_base.trim_end_matches('/');

    let target = match state.orchestrator.confirm_by_reference(&query.reference).await {
        Ok(intent) => format!("{}?intent_id={}&status={}", base, intent.id, intent.status),
        Err(BookingError::Reconciliation { intent_id, .. }) => {
            format!("{}?intent_id={}&status=processing", base, intent_id)
        }
        Err(BookingError::Gateway(e)) => {
            tracing::warn!(reference = %query.reference, error = %e, "Gateway unavailable on return");
            format!("{}?status=processing", base)
        }
        Err(e) => {
            tracing::warn!(reference = %query.reference, error = %e, "Payment return could not be resolved");
            format!("{}?status=error", base)
        }
    };

    Redirect::to(&target)
}
