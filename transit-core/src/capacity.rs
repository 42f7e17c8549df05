use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::StoreResult;

/// Lounge capacity is counted per exact (lounge, date, window).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub lounge_id: Uuid,
    pub date: NaiveDate,
    pub slot_start: NaiveTime,
    pub slot_end: NaiveTime,
}

/// A reservable unit. Seats are exclusive; lounge slots are counted by guests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapacityRef {
    Seat { trip_id: Uuid, seat_id: String },
    LoungeSlot { slot: SlotKey, guests: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    SeatTaken,
    SlotFull { requested: u32, available: u32 },
    UnknownResource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Denial {
    pub unit: CapacityRef,
    pub reason: DenialReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldOutcome {
    pub granted: Vec<CapacityRef>,
    pub denied: Vec<Denial>,
}

impl HoldOutcome {
    pub fn is_complete(&self) -> bool {
        self.denied.is_empty()
    }
}

/// Per-resource availability primitives. Every hold is a single conditional
/// write in the backing store, so the first writer wins a contended unit.
#[async_trait]
pub trait CapacityLedger: Send + Sync {
    /// Claim every unit for `intent_id`. Units that cannot be claimed are
    /// reported in `denied`; the caller decides whether to roll back.
    async fn try_hold(
        &self,
        units: &[CapacityRef],
        intent_id: Uuid,
        held_until: DateTime<Utc>,
    ) -> StoreResult<HoldOutcome>;

    /// Move the informational `held_until` of units still held by `intent_id`.
    async fn extend(
        &self,
        units: &[CapacityRef],
        intent_id: Uuid,
        held_until: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Return units owned by `intent_id` (held or booked) to the pool.
    /// Units owned by anyone else are left alone, so release is idempotent.
    async fn release(&self, units: &[CapacityRef], intent_id: Uuid) -> StoreResult<()>;

    /// Held → booked. Re-committing units already booked by `intent_id` is a no-op.
    async fn commit(&self, units: &[CapacityRef], intent_id: Uuid) -> StoreResult<()>;

    /// Currently available seat ids on a trip, used to suggest alternatives.
    async fn available_seats(&self, trip_id: Uuid, limit: usize) -> StoreResult<Vec<String>>;
}
