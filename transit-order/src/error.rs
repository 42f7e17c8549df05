use serde::Serialize;
use transit_catalog::PricingError;
use transit_core::intent::{IntentStatus, LoungeLeg};
use transit_core::payment::{GatewayError, PaymentStatus};
use transit_core::StoreError;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingLeg {
    Bus,
    PreTripLounge,
    PostTripLounge,
}

impl From<LoungeLeg> for BookingLeg {
    fn from(leg: LoungeLeg) -> Self {
        match leg {
            LoungeLeg::PreTrip => BookingLeg::PreTripLounge,
            LoungeLeg::PostTrip => BookingLeg::PostTripLounge,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    SeatsTaken,
    FullyBooked,
    TripDeparted,
}

/// Why one sub-booking could not be held.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LegAvailability {
    pub leg: BookingLeg,
    pub reason: UnavailableReason,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub seats: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_guests: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_guests: Option<u32>,
    /// Free seats on the same trip at the time of the attempt.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AvailabilityReport {
    pub unavailable: Vec<LegAvailability>,
}

impl AvailabilityReport {
    pub fn leg(&self, leg: BookingLeg) -> Option<&LegAvailability> {
        self.unavailable.iter().find(|l| l.leg == leg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Requested capacity is not available")]
    PartialAvailability(AvailabilityReport),

    #[error("Intent {intent_id} is {status}: {reason}")]
    StateConflict {
        intent_id: Uuid,
        status: IntentStatus,
        reason: String,
    },

    #[error("Another request with this idempotency key is still in progress")]
    KeyInUse,

    #[error("Intent not found: {0}")]
    NotFound(Uuid),

    #[error("Intent belongs to another user")]
    Forbidden,

    #[error("Payment not completed: {}", .0.as_str())]
    PaymentIncomplete(PaymentStatus),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Intent {intent_id} needs reconciliation: {reason}")]
    Reconciliation {
        intent_id: Uuid,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<PricingError> for BookingError {
    fn from(err: PricingError) -> Self {
        BookingError::Validation(err.to_string())
    }
}
