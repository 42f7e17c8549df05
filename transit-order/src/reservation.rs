//! Capacity hold planning. An intent's units are grouped per sub-booking so a
//! leg is held all-or-nothing: a partially granted group is released before
//! the denial is reported.

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use transit_core::capacity::{CapacityLedger, CapacityRef, Denial};
use transit_core::clock::Clock;
use transit_core::intent::{BookingIntent, BusSelection, IntentPayload, LoungeSelection};
use transit_core::repository::IntentRepository;
use transit_core::StoreResult;
use uuid::Uuid;

use crate::error::BookingLeg;
use crate::validation::slot_key;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HoldGroup {
    pub leg: BookingLeg,
    pub units: Vec<CapacityRef>,
}

pub(crate) fn bus_units(bus: &BusSelection) -> Vec<CapacityRef> {
    bus.seats
        .iter()
        .map(|s| CapacityRef::Seat {
            trip_id: bus.trip_id,
            seat_id: s.seat_id.clone(),
        })
        .collect()
}

pub(crate) fn lounge_units(lounge: &LoungeSelection) -> Vec<CapacityRef> {
    vec![CapacityRef::LoungeSlot {
        slot: slot_key(lounge),
        guests: lounge.guest_count(),
    }]
}

pub(crate) fn hold_groups(payload: &IntentPayload) -> Vec<HoldGroup> {
    let mut groups = Vec::new();
    if let Some(bus) = payload.bus() {
        groups.push(HoldGroup {
            leg: BookingLeg::Bus,
            units: bus_units(bus),
        });
    }
    for (leg, lounge) in payload.lounge_legs() {
        groups.push(HoldGroup {
            leg: leg.into(),
            units: lounge_units(lounge),
        });
    }
    groups
}

pub(crate) fn all_units(payload: &IntentPayload) -> Vec<CapacityRef> {
    hold_groups(payload).into_iter().flat_map(|g| g.units).collect()
}

/// Holds one group. On a partial grant the granted units are released again
/// and the denials are returned.
pub(crate) async fn hold_group(
    ledger: &dyn CapacityLedger,
    group: &HoldGroup,
    intent_id: Uuid,
    held_until: DateTime<Utc>,
) -> StoreResult<Result<(), Vec<Denial>>> {
    let outcome = ledger.try_hold(&group.units, intent_id, held_until).await?;
    if outcome.is_complete() {
        return Ok(Ok(()));
    }

    if !outcome.granted.is_empty() {
        if let Err(e) = ledger.release(&outcome.granted, intent_id).await {
            error!(
                intent_id = %intent_id,
                leg = ?group.leg,
                error = %e,
                "Failed to roll back partial hold"
            );
            return Err(e);
        }
    }
    Ok(Err(outcome.denied))
}

/// Frees everything the intent holds or booked and flags it as released.
/// A lost version race is tolerated since release is idempotent; the
/// current row is returned instead.
pub(crate) async fn release_intent_capacity(
    ledger: &dyn CapacityLedger,
    intents: &dyn IntentRepository,
    clock: &dyn Clock,
    intent: BookingIntent,
) -> StoreResult<BookingIntent> {
    ledger.release(&all_units(&intent.payload), intent.id).await?;

    let mut next = intent.clone();
    next.capacity_released = true;
    next.updated_at = clock.now();

    if intents.replace(&next, intent.version).await? {
        next.version = intent.version + 1;
        return Ok(next);
    }

    warn!(intent_id = %intent.id, "Intent changed while releasing capacity");
    Ok(intents.get(intent.id).await?.unwrap_or(next))
}
