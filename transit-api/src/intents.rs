use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use transit_core::intent::{
    BookingIntent, BookingResult, IntentSelection, IntentStatus, IntentType, LoungeLeg, LoungeSelection,
    PriceSnapshot,
};
use transit_core::payment::PaymentStatus;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PaymentView {
    pub reference: Option<String>,
    pub payment_url: Option<String>,
    pub status: Option<PaymentStatus>,
    pub paid_amount: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct IntentResponse {
    pub intent_id: Uuid,
    pub intent_type: IntentType,
    pub status: IntentStatus,
    pub pricing: PriceSnapshot,
    pub expires_at: DateTime<Utc>,
    pub payment: PaymentView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<BookingResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<BookingIntent> for IntentResponse {
    fn from(intent: BookingIntent) -> Self {
        Self {
            intent_id: intent.id,
            intent_type: intent.intent_type,
            status: intent.status,
            pricing: intent.pricing,
            expires_at: intent.expires_at,
            payment: PaymentView {
                reference: intent.payment.gateway_reference,
                payment_url: intent.payment.payment_url,
                status: intent.payment.last_status,
                paid_amount: intent.payment.paid_amount,
            },
            result: intent.result,
            cancellation_reason: intent.cancellation_reason,
            failure_reason: intent.failure_reason,
            created_at: intent.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub intent_id: Uuid,
    pub reference: String,
    pub payment_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddLoungeRequest {
    pub leg: LoungeLeg,
    pub lounge: LoungeSelection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub payment_reference: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/intents
/// Holds every requested sub-booking. 201 for a new intent, 200 for a replay.
pub async fn create_intent(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    headers: HeaderMap,
    Json(selection): Json<IntentSelection>,
) -> Result<(StatusCode, Json<IntentResponse>), AppError> {
    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok());

    let created = state
        .orchestrator
        .create_intent(user.user_id, selection, key)
        .await?;

    let status = if created.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(created.intent.into())))
}

/// GET /v1/intents/{id}
pub async fn get_intent(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = state.orchestrator.get_intent(user.user_id, intent_id).await?;
    Ok(Json(intent.into()))
}

/// POST /v1/intents/{id}/payment
pub async fn initiate_payment(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(intent_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let started = state
        .orchestrator
        .initiate_payment(user.user_id, intent_id)
        .await?;

    Ok(Json(PaymentResponse {
        intent_id: started.intent.id,
        reference: started.session.reference,
        payment_url: started.session.payment_url,
        expires_at: started.intent.expires_at,
    }))
}

/// POST /v1/intents/{id}/cancel
pub async fn cancel_intent(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(intent_id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = state
        .orchestrator
        .cancel_intent(user.user_id, intent_id, req.reason)
        .await?;
    Ok(Json(intent.into()))
}

/// POST /v1/intents/{id}/lounges
pub async fn add_lounge(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(intent_id): Path<Uuid>,
    Json(req): Json<AddLoungeRequest>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = state
        .orchestrator
        .add_lounge_to_intent(user.user_id, intent_id, req.leg, req.lounge)
        .await?;
    Ok(Json(intent.into()))
}

/// POST /v1/intents/{id}/confirm
/// The gateway is asked directly; a client claim of success is not enough.
pub async fn confirm_booking(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(intent_id): Path<Uuid>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = state
        .orchestrator
        .confirm_booking(user.user_id, intent_id, req.payment_reference.as_deref())
        .await?;
    Ok(Json(intent.into()))
}
