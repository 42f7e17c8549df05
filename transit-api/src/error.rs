use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use transit_core::payment::GatewayError;
use transit_order::BookingError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Booking(#[from] BookingError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn internal() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal Server Error" })),
    )
}

fn booking_response(err: BookingError) -> (StatusCode, Json<serde_json::Value>) {
    match err {
        BookingError::Validation(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))),
        BookingError::Forbidden => (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))),
        BookingError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("intent {} not found", id) })),
        ),
        BookingError::PartialAvailability(report) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "partial_availability",
                "unavailable": report.unavailable,
            })),
        ),
        BookingError::StateConflict {
            intent_id,
            status,
            reason,
        } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": reason, "intent_id": intent_id, "status": status })),
        ),
        BookingError::KeyInUse => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "idempotency_key_in_use" })),
        ),
        BookingError::PaymentIncomplete(status) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({ "error": "payment_incomplete", "payment_status": status })),
        ),
        BookingError::Gateway(GatewayError::InvalidSignature) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid signature" })),
        ),
        BookingError::Gateway(GatewayError::MalformedPayload(msg)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
        }
        BookingError::Gateway(e) => {
            tracing::warn!(error = %e, "Payment gateway call failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "status": "processing", "error": "payment provider unavailable" })),
            )
        }
        // Money may have moved; the customer only learns that we are on it.
        BookingError::Reconciliation { intent_id, reason } => {
            tracing::error!(intent_id = %intent_id, reason = %reason, "Booking needs reconciliation");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "processing", "intent_id": intent_id })),
            )
        }
        BookingError::Storage(e) => {
            tracing::error!(error = %e, "Storage failure");
            internal()
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg }))),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, Json(json!({ "error": msg }))),
            AppError::Booking(err) => booking_response(err),
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {}", err);
                internal()
            }
        };

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transit_core::intent::IntentStatus;
    use transit_core::payment::PaymentStatus;
    use uuid::Uuid;

    fn status_of(err: BookingError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_booking_errors_map_to_http_statuses() {
        assert_eq!(status_of(BookingError::Validation("bad".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(BookingError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_of(BookingError::NotFound(Uuid::new_v4())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(BookingError::StateConflict {
                intent_id: Uuid::new_v4(),
                status: IntentStatus::Expired,
                reason: "hold has expired".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(BookingError::KeyInUse), StatusCode::CONFLICT);
        assert_eq!(
            status_of(BookingError::PaymentIncomplete(PaymentStatus::Pending)),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(BookingError::Gateway(GatewayError::Timeout)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(BookingError::Gateway(GatewayError::InvalidSignature)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(BookingError::Reconciliation {
                intent_id: Uuid::new_v4(),
                reason: "amount_mismatch".into(),
            }),
            StatusCode::ACCEPTED
        );
    }
}
