use axum::{
    extract::{Path, State},
    Extension, Json,
};
use transit_core::audit::PaymentAudit;
use uuid::Uuid;

use crate::error::AppError;
use crate::intents::IntentResponse;
use crate::middleware::auth::{has_permission, AdminClaims, REFUNDS_PERMISSION};
use crate::state::AppState;

fn require_refunds(claims: &AdminClaims) -> Result<(), AppError> {
    if has_permission(claims, REFUNDS_PERMISSION) {
        return Ok(());
    }
    Err(AppError::Forbidden(format!("missing permission {}", REFUNDS_PERMISSION)))
}

/// GET /v1/admin/intents/{id}
pub async fn get_intent(
    State(state): State<AppState>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = state.orchestrator.find_intent(intent_id).await?;
    Ok(Json(intent.into()))
}

/// POST /v1/admin/intents/{id}/refund
pub async fn initiate_refund(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<IntentResponse>, AppError> {
    require_refunds(&claims)?;
    tracing::info!(intent_id = %intent_id, operator = %claims.sub, "Refund requested");

    let intent = state.orchestrator.initiate_refund(intent_id).await?;
    Ok(Json(intent.into()))
}

/// POST /v1/admin/intents/{id}/refund/complete
pub async fn complete_refund(
    State(state): State<AppState>,
    Extension(claims): Extension<AdminClaims>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<IntentResponse>, AppError> {
    require_refunds(&claims)?;

    let intent = state.orchestrator.complete_refund(intent_id).await?;
    Ok(Json(intent.into()))
}

/// GET /v1/admin/intents/{id}/audit
pub async fn audit_trail(
    State(state): State<AppState>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentAudit>>, AppError> {
    Ok(Json(state.orchestrator.audit_trail(intent_id).await?))
}
