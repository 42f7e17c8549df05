use std::collections::HashSet;
use transit_core::capacity::SlotKey;
use transit_core::intent::{
    BusSelection, IntentPayload, IntentSelection, IntentType, LoungeLeg, LoungeLegs, LoungeSelection,
};

use crate::error::BookingError;

fn invalid(message: impl Into<String>) -> BookingError {
    BookingError::Validation(message.into())
}

/// Checks the shape of a request and freezes it into a payload whose
/// variant matches the declared intent type.
pub fn validate_selection(selection: IntentSelection, max_seats: usize) -> Result<IntentPayload, BookingError> {
    if let Some(bus) = &selection.bus {
        validate_bus(bus, max_seats)?;
    }
    if let Some(lounge) = &selection.pre_trip_lounge {
        validate_lounge(LoungeLeg::PreTrip, lounge)?;
    }
    if let Some(lounge) = &selection.post_trip_lounge {
        validate_lounge(LoungeLeg::PostTrip, lounge)?;
    }

    let lounges = LoungeLegs {
        pre_trip: selection.pre_trip_lounge,
        post_trip: selection.post_trip_lounge,
    };
    validate_distinct_slots(&lounges)?;

    match (selection.intent_type, selection.bus, lounges.is_empty()) {
        (IntentType::BusOnly, Some(bus), true) => Ok(IntentPayload::BusOnly { bus }),
        (IntentType::BusOnly, None, _) => Err(invalid("bus_only intent requires a bus selection")),
        (IntentType::BusOnly, Some(_), false) => Err(invalid("bus_only intent cannot carry lounge selections")),

        (IntentType::LoungeOnly, None, false) => Ok(IntentPayload::LoungeOnly { lounges }),
        (IntentType::LoungeOnly, Some(_), _) => Err(invalid("lounge_only intent cannot carry a bus selection")),
        (IntentType::LoungeOnly, None, true) => Err(invalid("lounge_only intent requires at least one lounge")),

        (IntentType::Combined, Some(bus), false) => Ok(IntentPayload::Combined { bus, lounges }),
        (IntentType::Combined, _, _) => Err(invalid(
            "combined intent requires a bus selection and at least one lounge",
        )),
    }
}

pub fn validate_bus(bus: &BusSelection, max_seats: usize) -> Result<(), BookingError> {
    if bus.seats.is_empty() {
        return Err(invalid("at least one seat is required"));
    }
    if bus.seats.len() > max_seats {
        return Err(invalid(format!("at most {} seats may be held per intent", max_seats)));
    }
    if bus.boarding_stop_id == bus.alighting_stop_id {
        return Err(invalid("boarding and alighting stops must differ"));
    }

    let mut seen = HashSet::new();
    for seat in &bus.seats {
        if seat.seat_id.trim().is_empty() {
            return Err(invalid("seat id must not be empty"));
        }
        if !seen.insert(seat.seat_id.as_str()) {
            return Err(invalid(format!("seat {} selected more than once", seat.seat_id)));
        }
        if seat.passenger.name.trim().is_empty() {
            return Err(invalid(format!("passenger name missing for seat {}", seat.seat_id)));
        }
    }

    let primaries = bus.seats.iter().filter(|s| s.passenger.is_primary).count();
    if primaries > 1 {
        return Err(invalid("only one passenger may be marked primary"));
    }
    Ok(())
}

pub fn validate_lounge(leg: LoungeLeg, lounge: &LoungeSelection) -> Result<(), BookingError> {
    let label = match leg {
        LoungeLeg::PreTrip => "pre-trip lounge",
        LoungeLeg::PostTrip => "post-trip lounge",
    };

    if lounge.guests.is_empty() {
        return Err(invalid(format!("{} requires at least one guest", label)));
    }
    if lounge.guests.iter().any(|g| g.name.trim().is_empty()) {
        return Err(invalid(format!("{} guest name must not be empty", label)));
    }
    if lounge.slot_end <= lounge.slot_start {
        return Err(invalid(format!("{} slot must end after it starts", label)));
    }
    if lounge.pre_orders.iter().any(|line| line.quantity == 0) {
        return Err(invalid(format!("{} pre-order quantity must be at least 1", label)));
    }
    Ok(())
}

/// Both legs on the same lounge window would share one capacity hold.
pub fn validate_distinct_slots(lounges: &LoungeLegs) -> Result<(), BookingError> {
    if let (Some(pre), Some(post)) = (&lounges.pre_trip, &lounges.post_trip) {
        if slot_key(pre) == slot_key(post) {
            return Err(invalid("pre-trip and post-trip lounges cannot share the same slot"));
        }
    }
    Ok(())
}

pub(crate) fn slot_key(lounge: &LoungeSelection) -> SlotKey {
    SlotKey {
        lounge_id: lounge.lounge_id,
        date: lounge.date,
        slot_start: lounge.slot_start,
        slot_end: lounge.slot_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use transit_core::intent::{GuestInfo, LoungePricingType, PassengerInfo, PreOrderLine, SeatSelection};
    use uuid::Uuid;

    fn seat(id: &str) -> SeatSelection {
        SeatSelection {
            seat_id: id.to_string(),
            passenger: PassengerInfo {
                name: "Kamal".to_string(),
                phone: None,
                is_primary: false,
            },
        }
    }

    fn bus(seats: &[&str]) -> BusSelection {
        BusSelection {
            trip_id: Uuid::new_v4(),
            boarding_stop_id: Uuid::new_v4(),
            alighting_stop_id: Uuid::new_v4(),
            seats: seats.iter().map(|s| seat(s)).collect(),
        }
    }

    fn lounge(start: u32, end: u32) -> LoungeSelection {
        LoungeSelection {
            lounge_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            slot_start: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            slot_end: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            pricing_type: LoungePricingType::TwoHours,
            guests: vec![GuestInfo {
                name: "Sunil".to_string(),
                phone: None,
            }],
            pre_orders: vec![],
        }
    }

    fn selection(intent_type: IntentType, bus: Option<BusSelection>, pre: Option<LoungeSelection>) -> IntentSelection {
        IntentSelection {
            intent_type,
            bus,
            pre_trip_lounge: pre,
            post_trip_lounge: None,
        }
    }

    #[test]
    fn test_type_must_match_selections() {
        let ok = validate_selection(selection(IntentType::BusOnly, Some(bus(&["A1"])), None), 10).unwrap();
        assert_eq!(ok.intent_type(), IntentType::BusOnly);

        let combined =
            validate_selection(selection(IntentType::Combined, Some(bus(&["A1"])), Some(lounge(8, 10))), 10).unwrap();
        assert_eq!(combined.intent_type(), IntentType::Combined);

        assert!(validate_selection(selection(IntentType::BusOnly, None, None), 10).is_err());
        assert!(validate_selection(selection(IntentType::BusOnly, Some(bus(&["A1"])), Some(lounge(8, 10))), 10).is_err());
        assert!(validate_selection(selection(IntentType::LoungeOnly, Some(bus(&["A1"])), Some(lounge(8, 10))), 10).is_err());
        assert!(validate_selection(selection(IntentType::Combined, None, Some(lounge(8, 10))), 10).is_err());
        assert!(validate_selection(selection(IntentType::Combined, Some(bus(&["A1"])), None), 10).is_err());
    }

    #[test]
    fn test_seat_rules() {
        assert!(validate_bus(&bus(&[]), 10).is_err());
        assert!(validate_bus(&bus(&["A1", "A1"]), 10).is_err());
        assert!(validate_bus(&bus(&["A1", "A2", "A3"]), 2).is_err());
        assert!(validate_bus(&bus(&["A1", "A2"]), 2).is_ok());

        let mut same_stop = bus(&["A1"]);
        same_stop.alighting_stop_id = same_stop.boarding_stop_id;
        assert!(validate_bus(&same_stop, 10).is_err());
    }

    #[test]
    fn test_lounge_rules() {
        assert!(validate_lounge(LoungeLeg::PreTrip, &lounge(8, 10)).is_ok());
        assert!(validate_lounge(LoungeLeg::PreTrip, &lounge(10, 10)).is_err());
        assert!(validate_lounge(LoungeLeg::PreTrip, &lounge(11, 10)).is_err());

        let mut no_guests = lounge(8, 10);
        no_guests.guests.clear();
        assert!(validate_lounge(LoungeLeg::PostTrip, &no_guests).is_err());

        let mut zero_qty = lounge(8, 10);
        zero_qty.pre_orders.push(PreOrderLine {
            product_id: Uuid::new_v4(),
            quantity: 0,
        });
        assert!(matches!(
            validate_lounge(LoungeLeg::PreTrip, &zero_qty),
            Err(BookingError::Validation(_))
        ));
    }

    #[test]
    fn test_legs_cannot_share_a_slot() {
        let pre = lounge(8, 10);
        let legs = LoungeLegs {
            pre_trip: Some(pre.clone()),
            post_trip: Some(pre),
        };
        assert!(validate_distinct_slots(&legs).is_err());
    }
}
