use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use transit_core::capacity::{CapacityLedger, CapacityRef, Denial, DenialReason, HoldOutcome, SlotKey};
use transit_core::{StoreError, StoreResult};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatState {
    Available,
    Held { intent_id: Uuid, held_until: DateTime<Utc> },
    Booked { intent_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoungeHoldStatus {
    Held,
    Confirmed,
    Released,
}

#[derive(Debug, Clone)]
struct SlotCounter {
    capacity: u32,
    held_guests: u32,
}

#[derive(Debug, Clone)]
struct LoungeHold {
    guests: u32,
    status: LoungeHoldStatus,
    held_until: DateTime<Utc>,
}

/// Concurrent in-memory capacity ledger.
///
/// Each seat transition happens under the DashMap shard lock for that seat,
/// which gives the same first-writer-wins behaviour as a conditional UPDATE.
/// Lounge slots keep a guest counter that is only incremented while the
/// result stays within the lounge capacity.
///
/// No shard guard is held across an `.await`.
#[derive(Default)]
pub struct MemoryCapacityLedger {
    seats: DashMap<(Uuid, String), SeatState>,
    lounge_capacity: DashMap<Uuid, u32>,
    slots: DashMap<SlotKey, SlotCounter>,
    holds: DashMap<(Uuid, SlotKey), LoungeHold>,
    fail_commits: AtomicBool,
    fail_releases: AtomicBool,
}

impl MemoryCapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register bookable seats for a trip. Existing seats keep their state.
    pub fn add_seats<I, S>(&self, trip_id: Uuid, seat_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for seat_id in seat_ids {
            self.seats
                .entry((trip_id, seat_id.into()))
                .or_insert(SeatState::Available);
        }
    }

    pub fn set_lounge_capacity(&self, lounge_id: Uuid, capacity: u32) {
        self.lounge_capacity.insert(lounge_id, capacity);
    }

    pub fn seat_state(&self, trip_id: Uuid, seat_id: &str) -> Option<SeatState> {
        self.seats
            .get(&(trip_id, seat_id.to_string()))
            .map(|s| s.value().clone())
    }

    /// `(held_guests, capacity)` for a slot that has been touched.
    pub fn slot_usage(&self, slot: &SlotKey) -> Option<(u32, u32)> {
        self.slots.get(slot).map(|c| (c.held_guests, c.capacity))
    }

    pub fn lounge_hold_status(&self, intent_id: Uuid, slot: &SlotKey) -> Option<LoungeHoldStatus> {
        self.holds.get(&(intent_id, slot.clone())).map(|h| h.status)
    }

    /// Make every subsequent commit fail, to exercise post-payment failure paths.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    fn hold_seat(&self, trip_id: Uuid, seat_id: &str, intent_id: Uuid, held_until: DateTime<Utc>) -> Result<(), DenialReason> {
        let mut seat = self
            .seats
            .get_mut(&(trip_id, seat_id.to_string()))
            .ok_or(DenialReason::UnknownResource)?;

        match *seat {
            SeatState::Available => {
                *seat = SeatState::Held { intent_id, held_until };
                Ok(())
            }
            SeatState::Held { intent_id: owner, .. } if owner == intent_id => Ok(()),
            _ => Err(DenialReason::SeatTaken),
        }
    }

    fn hold_slot(&self, slot: &SlotKey, guests: u32, intent_id: Uuid, held_until: DateTime<Utc>) -> Result<(), DenialReason> {
        let capacity = self
            .lounge_capacity
            .get(&slot.lounge_id)
            .map(|c| *c)
            .ok_or(DenialReason::UnknownResource)?;

        {
            let mut counter = self.slots.entry(slot.clone()).or_insert(SlotCounter {
                capacity,
                held_guests: 0,
            });
            let available = counter.capacity.saturating_sub(counter.held_guests);
            if guests > available {
                return Err(DenialReason::SlotFull {
                    requested: guests,
                    available,
                });
            }
            counter.held_guests += guests;
        }

        let mut hold = self
            .holds
            .entry((intent_id, slot.clone()))
            .or_insert(LoungeHold {
                guests: 0,
                status: LoungeHoldStatus::Held,
                held_until,
            });
        if hold.status == LoungeHoldStatus::Released {
            hold.guests = 0;
            hold.status = LoungeHoldStatus::Held;
        }
        hold.guests += guests;
        hold.held_until = held_until;
        Ok(())
    }

    fn release_slot(&self, slot: &SlotKey, intent_id: Uuid) {
        let freed = match self.holds.get_mut(&(intent_id, slot.clone())) {
            Some(mut hold) if hold.status != LoungeHoldStatus::Released => {
                hold.status = LoungeHoldStatus::Released;
                hold.guests
            }
            _ => 0,
        };

        if freed > 0 {
            if let Some(mut counter) = self.slots.get_mut(slot) {
                counter.held_guests = counter.held_guests.saturating_sub(freed);
            }
        }
    }
}

#[async_trait]
impl CapacityLedger for MemoryCapacityLedger {
    async fn try_hold(
        &self,
        units: &[CapacityRef],
        intent_id: Uuid,
        held_until: DateTime<Utc>,
    ) -> StoreResult<HoldOutcome> {
        let mut outcome = HoldOutcome::default();

        for unit in units {
            let result = match unit {
                CapacityRef::Seat { trip_id, seat_id } => self.hold_seat(*trip_id, seat_id, intent_id, held_until),
                CapacityRef::LoungeSlot { slot, guests } => self.hold_slot(slot, *guests, intent_id, held_until),
            };
            match result {
                Ok(()) => outcome.granted.push(unit.clone()),
                Err(reason) => outcome.denied.push(Denial {
                    unit: unit.clone(),
                    reason,
                }),
            }
        }

        Ok(outcome)
    }

    async fn extend(&self, units: &[CapacityRef], intent_id: Uuid, held_until: DateTime<Utc>) -> StoreResult<()> {
        for unit in units {
            match unit {
                CapacityRef::Seat { trip_id, seat_id } => {
                    if let Some(mut seat) = self.seats.get_mut(&(*trip_id, seat_id.clone())) {
                        if matches!(*seat, SeatState::Held { intent_id: owner, .. } if owner == intent_id) {
                            *seat = SeatState::Held { intent_id, held_until };
                        }
                    }
                }
                CapacityRef::LoungeSlot { slot, .. } => {
                    if let Some(mut hold) = self.holds.get_mut(&(intent_id, slot.clone())) {
                        if hold.status == LoungeHoldStatus::Held {
                            hold.held_until = held_until;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn release(&self, units: &[CapacityRef], intent_id: Uuid) -> StoreResult<()> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("capacity ledger release failed".into()));
        }

        for unit in units {
            match unit {
                CapacityRef::Seat { trip_id, seat_id } => {
                    if let Some(mut seat) = self.seats.get_mut(&(*trip_id, seat_id.clone())) {
                        let owned = match *seat {
                            SeatState::Held { intent_id: owner, .. } => owner == intent_id,
                            SeatState::Booked { intent_id: owner } => owner == intent_id,
                            SeatState::Available => false,
                        };
                        if owned {
                            *seat = SeatState::Available;
                        }
                    }
                }
                CapacityRef::LoungeSlot { slot, .. } => self.release_slot(slot, intent_id),
            }
        }
        Ok(())
    }

    async fn commit(&self, units: &[CapacityRef], intent_id: Uuid) -> StoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("capacity ledger commit failed".into()));
        }

        for unit in units {
            match unit {
                CapacityRef::Seat { trip_id, seat_id } => {
                    let mut seat = self
                        .seats
                        .get_mut(&(*trip_id, seat_id.clone()))
                        .ok_or_else(|| StoreError::Conflict(format!("seat {} not found", seat_id)))?;
                    match *seat {
                        SeatState::Held { intent_id: owner, .. } if owner == intent_id => {
                            *seat = SeatState::Booked { intent_id };
                        }
                        SeatState::Booked { intent_id: owner } if owner == intent_id => {}
                        _ => {
                            return Err(StoreError::Conflict(format!(
                                "seat {} is not held by intent {}",
                                seat_id, intent_id
                            )))
                        }
                    }
                }
                CapacityRef::LoungeSlot { slot, .. } => {
                    let mut hold = self
                        .holds
                        .get_mut(&(intent_id, slot.clone()))
                        .ok_or_else(|| StoreError::Conflict(format!("no lounge hold for intent {}", intent_id)))?;
                    match hold.status {
                        LoungeHoldStatus::Held => hold.status = LoungeHoldStatus::Confirmed,
                        LoungeHoldStatus::Confirmed => {}
                        LoungeHoldStatus::Released => {
                            return Err(StoreError::Conflict(format!(
                                "lounge hold for intent {} was released",
                                intent_id
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn available_seats(&self, trip_id: Uuid, limit: usize) -> StoreResult<Vec<String>> {
        let mut seats: Vec<String> = self
            .seats
            .iter()
            .filter(|entry| entry.key().0 == trip_id && *entry.value() == SeatState::Available)
            .map(|entry| entry.key().1.clone())
            .collect();
        seats.sort();
        seats.truncate(limit);
        Ok(seats)
    }
}
