use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use transit_shared::pii::Masked;
use uuid::Uuid;

use crate::payment::PaymentStatus;

// ============================================================================
// Status & Type
// ============================================================================

/// Lifecycle of a booking intent.
///
/// `held`/`payment_pending` are the open states governed by the hold TTL.
/// Once `confirming` begins the TTL no longer applies: the intent must end in
/// `confirmed` or `confirmation_failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Held,
    PaymentPending,
    Confirming,
    Confirmed,
    Expired,
    Cancelled,
    ConfirmationFailed,
    RefundInitiated,
    Refunded,
}

impl IntentStatus {
    pub const TERMINAL: [IntentStatus; 4] = [
        IntentStatus::Confirmed,
        IntentStatus::Expired,
        IntentStatus::Cancelled,
        IntentStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Held => "held",
            IntentStatus::PaymentPending => "payment_pending",
            IntentStatus::Confirming => "confirming",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Expired => "expired",
            IntentStatus::Cancelled => "cancelled",
            IntentStatus::ConfirmationFailed => "confirmation_failed",
            IntentStatus::RefundInitiated => "refund_initiated",
            IntentStatus::Refunded => "refunded",
        }
    }

    /// Terminal intents are immutable apart from audit metadata.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Open intents own capacity under a TTL and may still be paid or cancelled.
    pub fn is_open(&self) -> bool {
        matches!(self, IntentStatus::Held | IntentStatus::PaymentPending)
    }

    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Held, PaymentPending)
                | (Held | PaymentPending, Confirming)
                | (Held | PaymentPending, Expired)
                | (Held | PaymentPending, Cancelled)
                | (Confirming, Confirmed)
                | (Confirming, ConfirmationFailed)
                | (ConfirmationFailed, RefundInitiated)
                | (RefundInitiated, Refunded)
        )
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(IntentStatus::Held),
            "payment_pending" => Ok(IntentStatus::PaymentPending),
            "confirming" => Ok(IntentStatus::Confirming),
            "confirmed" => Ok(IntentStatus::Confirmed),
            "expired" => Ok(IntentStatus::Expired),
            "cancelled" => Ok(IntentStatus::Cancelled),
            "confirmation_failed" => Ok(IntentStatus::ConfirmationFailed),
            "refund_initiated" => Ok(IntentStatus::RefundInitiated),
            "refunded" => Ok(IntentStatus::Refunded),
            other => Err(format!("unknown intent status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    BusOnly,
    LoungeOnly,
    Combined,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::BusOnly => "bus_only",
            IntentType::LoungeOnly => "lounge_only",
            IntentType::Combined => "combined",
        }
    }
}

impl FromStr for IntentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bus_only" => Ok(IntentType::BusOnly),
            "lounge_only" => Ok(IntentType::LoungeOnly),
            "combined" => Ok(IntentType::Combined),
            other => Err(format!("unknown intent type: {}", other)),
        }
    }
}

// ============================================================================
// Selections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassengerInfo {
    pub name: String,
    #[serde(default)]
    pub phone: Option<Masked<String>>,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatSelection {
    pub seat_id: String,
    pub passenger: PassengerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusSelection {
    pub trip_id: Uuid,
    pub boarding_stop_id: Uuid,
    pub alighting_stop_id: Uuid,
    pub seats: Vec<SeatSelection>,
}

impl BusSelection {
    pub fn seat_ids(&self) -> Vec<String> {
        self.seats.iter().map(|s| s.seat_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoungePricingType {
    OneHour,
    TwoHours,
    ThreeHours,
    UntilBus,
}

impl LoungePricingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoungePricingType::OneHour => "one_hour",
            LoungePricingType::TwoHours => "two_hours",
            LoungePricingType::ThreeHours => "three_hours",
            LoungePricingType::UntilBus => "until_bus",
        }
    }
}

impl FromStr for LoungePricingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_hour" => Ok(LoungePricingType::OneHour),
            "two_hours" => Ok(LoungePricingType::TwoHours),
            "three_hours" => Ok(LoungePricingType::ThreeHours),
            "until_bus" => Ok(LoungePricingType::UntilBus),
            other => Err(format!("unknown lounge pricing type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuestInfo {
    pub name: String,
    #[serde(default)]
    pub phone: Option<Masked<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreOrderLine {
    pub product_id: Uuid,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoungeSelection {
    pub lounge_id: Uuid,
    pub date: NaiveDate,
    pub slot_start: NaiveTime,
    pub slot_end: NaiveTime,
    pub pricing_type: LoungePricingType,
    pub guests: Vec<GuestInfo>,
    #[serde(default)]
    pub pre_orders: Vec<PreOrderLine>,
}

impl LoungeSelection {
    pub fn guest_count(&self) -> u32 {
        self.guests.len() as u32
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoungeLeg {
    PreTrip,
    PostTrip,
}

/// Client-facing shape of a CreateIntent request before validation turns it
/// into an [`IntentPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentSelection {
    pub intent_type: IntentType,
    #[serde(default)]
    pub bus: Option<BusSelection>,
    #[serde(default)]
    pub pre_trip_lounge: Option<LoungeSelection>,
    #[serde(default)]
    pub post_trip_lounge: Option<LoungeSelection>,
}

// ============================================================================
// Payload
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoungeLegs {
    #[serde(default)]
    pub pre_trip: Option<LoungeSelection>,
    #[serde(default)]
    pub post_trip: Option<LoungeSelection>,
}

impl LoungeLegs {
    pub fn is_empty(&self) -> bool {
        self.pre_trip.is_none() && self.post_trip.is_none()
    }

    pub fn get(&self, leg: LoungeLeg) -> Option<&LoungeSelection> {
        match leg {
            LoungeLeg::PreTrip => self.pre_trip.as_ref(),
            LoungeLeg::PostTrip => self.post_trip.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (LoungeLeg, &LoungeSelection)> {
        self.pre_trip
            .iter()
            .map(|s| (LoungeLeg::PreTrip, s))
            .chain(self.post_trip.iter().map(|s| (LoungeLeg::PostTrip, s)))
    }

    fn set(&mut self, leg: LoungeLeg, selection: LoungeSelection) {
        match leg {
            LoungeLeg::PreTrip => self.pre_trip = Some(selection),
            LoungeLeg::PostTrip => self.post_trip = Some(selection),
        }
    }
}

/// Frozen selection carried by an intent. The variant fixes which
/// sub-bookings exist, so a `bus_only` intent cannot hold a lounge leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentPayload {
    BusOnly { bus: BusSelection },
    LoungeOnly { lounges: LoungeLegs },
    Combined { bus: BusSelection, lounges: LoungeLegs },
}

impl IntentPayload {
    pub fn intent_type(&self) -> IntentType {
        match self {
            IntentPayload::BusOnly { .. } => IntentType::BusOnly,
            IntentPayload::LoungeOnly { .. } => IntentType::LoungeOnly,
            IntentPayload::Combined { .. } => IntentType::Combined,
        }
    }

    pub fn bus(&self) -> Option<&BusSelection> {
        match self {
            IntentPayload::BusOnly { bus } | IntentPayload::Combined { bus, .. } => Some(bus),
            IntentPayload::LoungeOnly { .. } => None,
        }
    }

    pub fn lounges(&self) -> Option<&LoungeLegs> {
        match self {
            IntentPayload::LoungeOnly { lounges } | IntentPayload::Combined { lounges, .. } => {
                Some(lounges)
            }
            IntentPayload::BusOnly { .. } => None,
        }
    }

    pub fn lounge_legs(&self) -> Vec<(LoungeLeg, &LoungeSelection)> {
        self.lounges()
            .map(|l| l.iter().collect())
            .unwrap_or_default()
    }

    /// Returns the payload with an extra lounge leg. A `bus_only` payload is
    /// upgraded to `combined`. Fails if the leg is already present.
    pub fn with_lounge_leg(
        &self,
        leg: LoungeLeg,
        selection: LoungeSelection,
    ) -> Result<IntentPayload, String> {
        match self {
            IntentPayload::BusOnly { bus } => {
                let mut lounges = LoungeLegs::default();
                lounges.set(leg, selection);
                Ok(IntentPayload::Combined {
                    bus: bus.clone(),
                    lounges,
                })
            }
            IntentPayload::LoungeOnly { lounges } | IntentPayload::Combined { lounges, .. } => {
                if lounges.get(leg).is_some() {
                    return Err(format!("{:?} lounge leg already present", leg));
                }
                let mut next = self.clone();
                match &mut next {
                    IntentPayload::LoungeOnly { lounges }
                    | IntentPayload::Combined { lounges, .. } => lounges.set(leg, selection),
                    IntentPayload::BusOnly { .. } => {}
                }
                Ok(next)
            }
        }
    }
}

// ============================================================================
// Pricing, Payment tracking, Result linkage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatFare {
    pub seat_id: String,
    pub fare: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoungeFare {
    pub lounge_id: Uuid,
    pub guests: u32,
    pub rate_per_guest: f64,
    pub pre_orders: f64,
    pub total: f64,
}

/// Server-computed fare components frozen at creation. Never recomputed from
/// live prices; only a newly added lounge leg is priced later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSnapshot {
    #[serde(default)]
    pub seat_fares: Vec<SeatFare>,
    pub bus_fare: f64,
    #[serde(default)]
    pub pre_trip_lounge: Option<LoungeFare>,
    #[serde(default)]
    pub post_trip_lounge: Option<LoungeFare>,
    pub total: f64,
    pub currency: String,
}

impl PriceSnapshot {
    pub fn lounge_fare(&self, leg: LoungeLeg) -> Option<&LoungeFare> {
        match leg {
            LoungeLeg::PreTrip => self.pre_trip_lounge.as_ref(),
            LoungeLeg::PostTrip => self.post_trip_lounge.as_ref(),
        }
    }

    pub fn with_lounge_fare(&self, leg: LoungeLeg, fare: LoungeFare) -> PriceSnapshot {
        let mut next = self.clone();
        match leg {
            LoungeLeg::PreTrip => next.pre_trip_lounge = Some(fare),
            LoungeLeg::PostTrip => next.post_trip_lounge = Some(fare),
        }
        next.total = next.computed_total();
        next
    }

    pub fn computed_total(&self) -> f64 {
        let lounges: f64 = [&self.pre_trip_lounge, &self.post_trip_lounge]
            .iter()
            .filter_map(|f| f.as_ref())
            .map(|f| f.total)
            .sum();
        crate::round_money(self.bus_fare + lounges)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentTracking {
    pub gateway_reference: Option<String>,
    pub gateway_uid: Option<String>,
    pub payment_url: Option<String>,
    pub last_status: Option<PaymentStatus>,
    pub initiated_at: Option<DateTime<Utc>>,
    pub paid_amount: Option<f64>,
    pub refund_id: Option<String>,
}

/// Ids of the permanent bookings written on confirmation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BookingResult {
    pub bus_booking_id: Option<Uuid>,
    pub pre_trip_lounge_booking_id: Option<Uuid>,
    pub post_trip_lounge_booking_id: Option<Uuid>,
}

impl BookingResult {
    /// True when every sub-booking in the payload has a booking id.
    pub fn covers(&self, payload: &IntentPayload) -> bool {
        let bus_ok = payload.bus().is_none() || self.bus_booking_id.is_some();
        let lounges_ok = payload.lounge_legs().iter().all(|(leg, _)| match leg {
            LoungeLeg::PreTrip => self.pre_trip_lounge_booking_id.is_some(),
            LoungeLeg::PostTrip => self.post_trip_lounge_booking_id.is_some(),
        });
        bus_ok && lounges_ok
    }
}

// ============================================================================
// Intent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid intent transition from {from} to {to}")]
pub struct TransitionError {
    pub from: IntentStatus,
    pub to: IntentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingIntent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub idempotency_key: Option<String>,
    pub intent_type: IntentType,
    pub status: IntentStatus,
    pub payload: IntentPayload,
    pub pricing: PriceSnapshot,
    pub payment: PaymentTracking,
    pub result: Option<BookingResult>,
    pub expires_at: DateTime<Utc>,
    pub ttl_extended: bool,
    pub capacity_released: bool,
    pub cancellation_reason: Option<String>,
    pub failure_reason: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl BookingIntent {
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        idempotency_key: Option<String>,
        payload: IntentPayload,
        pricing: PriceSnapshot,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            user_id,
            idempotency_key,
            intent_type: payload.intent_type(),
            status: IntentStatus::Held,
            payload,
            pricing,
            payment: PaymentTracking::default(),
            result: None,
            expires_at: now + ttl,
            ttl_extended: false,
            capacity_released: false,
            cancellation_reason: None,
            failure_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Guard for InitiatePayment.
    pub fn can_initiate_payment(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && !self.is_expired(now)
    }

    /// Guard for ConfirmBooking.
    pub fn can_confirm(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && !self.is_expired(now)
    }

    pub fn transition(&mut self, to: IntentStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Extends the TTL the first time payment is initiated. Later calls are no-ops.
    pub fn extend_ttl_once(&mut self, by: Duration) -> bool {
        if self.ttl_extended {
            return false;
        }
        self.expires_at += by;
        self.ttl_extended = true;
        true
    }

    pub fn mark_confirmed(&mut self, result: BookingResult, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(IntentStatus::Confirmed, now)?;
        self.result = Some(result);
        self.confirmed_at = Some(now);
        Ok(())
    }
}
