use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use transit_catalog::ledger::{LoungeHoldStatus, SeatState};
use transit_catalog::{MemoryCapacityLedger, PricingEngine, StaticInventory};
use transit_core::audit::PaymentAuditEvent;
use transit_core::capacity::SlotKey;
use transit_core::clock::{Clock, ManualClock};
use transit_core::intent::{
    BookingIntent, BusSelection, GuestInfo, IntentSelection, IntentStatus, IntentType, LoungeLeg, LoungePricingType,
    LoungeSelection, PassengerInfo, PreOrderLine, SeatSelection,
};
use transit_core::inventory::{LoungeListing, LoungeProduct, LoungeRate, SeatListing, TripListing};
use transit_core::payment::{GatewayError, PaymentStatus};
use transit_core::repository::{InsertOutcome, IntentRepository, KeyClaim, PaymentReference};
use transit_core::{StoreError, StoreResult};
use transit_shared::pii::Masked;
use transit_store::{MemoryBookingWriter, MemoryIntentRepository, MemoryPaymentAuditLog};
use uuid::Uuid;

use crate::{
    BookingError, BookingLeg, BookingOrchestrator, Collaborators, IntentSweeper, MockPaymentGateway,
    OrchestratorRules, SweepReport, UnavailableReason, WebhookOutcome,
};

/// In-memory intent store with injectable insert latency and a one-shot
/// write failure keyed on the status being written.
#[derive(Default)]
struct ScriptedIntents {
    inner: MemoryIntentRepository,
    insert_delay: Mutex<Option<std::time::Duration>>,
    fail_write_to: Mutex<Option<IntentStatus>>,
}

impl ScriptedIntents {
    fn count(&self) -> usize {
        self.inner.count()
    }

    fn delay_inserts(&self, by: std::time::Duration) {
        *self.insert_delay.lock().unwrap() = Some(by);
    }

    fn fail_next_write_to(&self, status: IntentStatus) {
        *self.fail_write_to.lock().unwrap() = Some(status);
    }
}

#[async_trait]
impl IntentRepository for ScriptedIntents {
    async fn insert(&self, intent: &BookingIntent) -> StoreResult<InsertOutcome> {
        let delay = *self.insert_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.insert(intent).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<BookingIntent>> {
        self.inner.get(id).await
    }

    async fn find_by_idempotency_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<BookingIntent>> {
        self.inner.find_by_idempotency_key(user_id, key).await
    }

    async fn claim_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
        intent_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<KeyClaim> {
        self.inner
            .claim_idempotency_key(user_id, key, intent_id, now, stale_before)
            .await
    }

    async fn release_idempotency_key(&self, user_id: Uuid, key: &str, intent_id: Uuid) -> StoreResult<()> {
        self.inner.release_idempotency_key(user_id, key, intent_id).await
    }

    async fn replace(&self, intent: &BookingIntent, expected_version: i64) -> StoreResult<bool> {
        {
            let mut fail = self.fail_write_to.lock().unwrap();
            if *fail == Some(intent.status) {
                *fail = None;
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
        }
        self.inner.replace(intent, expected_version).await
    }

    async fn record_payment_reference(&self, reference: &PaymentReference) -> StoreResult<()> {
        self.inner.record_payment_reference(reference).await
    }

    async fn find_payment_reference(&self, reference: &str) -> StoreResult<Option<PaymentReference>> {
        self.inner.find_payment_reference(reference).await
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        self.inner.list_expired(now, limit).await
    }

    async fn list_unreleased(&self, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        self.inner.list_unreleased(limit).await
    }

    async fn list_stalled_confirmations(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        self.inner.list_stalled_confirmations(before, limit).await
    }
}

struct Harness {
    orchestrator: Arc<BookingOrchestrator>,
    sweeper: IntentSweeper,
    intents: Arc<ScriptedIntents>,
    ledger: Arc<MemoryCapacityLedger>,
    gateway: Arc<MockPaymentGateway>,
    audit: Arc<MemoryPaymentAuditLog>,
    bookings: Arc<MemoryBookingWriter>,
    clock: Arc<ManualClock>,
    trip_id: Uuid,
    stops: [Uuid; 3],
    lounge_id: Uuid,
    coffee_id: Uuid,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap()
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let intents = Arc::new(ScriptedIntents::default());
        let ledger = Arc::new(MemoryCapacityLedger::new());
        let gateway = Arc::new(MockPaymentGateway::new("whsec_test", "https://sandbox.test/pay"));
        let audit = Arc::new(MemoryPaymentAuditLog::new());
        let bookings = Arc::new(MemoryBookingWriter::new());
        let inventory = Arc::new(StaticInventory::new());

        let trip_id = Uuid::new_v4();
        let stops = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let seats = ["A1", "A2", "A3", "A4"];
        inventory.add_trip(TripListing {
            trip_id,
            departure_at: start() + Duration::hours(6),
            stops: stops.to_vec(),
            seats: seats
                .iter()
                .map(|s| SeatListing {
                    seat_id: s.to_string(),
                    fare: 1000.0,
                })
                .collect(),
            currency: "LKR".to_string(),
        });
        ledger.add_seats(trip_id, seats);

        let lounge_id = Uuid::new_v4();
        let coffee_id = Uuid::new_v4();
        inventory.add_lounge(LoungeListing {
            lounge_id,
            name: "Colombo Fort Lounge".to_string(),
            capacity: 3,
            rates: vec![
                LoungeRate {
                    pricing_type: LoungePricingType::TwoHours,
                    price_per_guest: 500.0,
                },
                LoungeRate {
                    pricing_type: LoungePricingType::UntilBus,
                    price_per_guest: 800.0,
                },
            ],
            products: vec![LoungeProduct {
                product_id: coffee_id,
                name: "Coffee".to_string(),
                price: 150.0,
            }],
            currency: "LKR".to_string(),
        });
        ledger.set_lounge_capacity(lounge_id, 3);

        let collaborators = Collaborators {
            intents: intents.clone(),
            ledger: ledger.clone(),
            inventory,
            gateway: gateway.clone(),
            audit: audit.clone(),
            bookings: bookings.clone(),
            clock: clock.clone(),
        };
        let orchestrator = Arc::new(BookingOrchestrator::new(
            collaborators,
            PricingEngine::default(),
            OrchestratorRules::default(),
        ));
        let sweeper = IntentSweeper::new(intents.clone(), ledger.clone(), clock.clone(), 100);

        Self {
            orchestrator,
            sweeper,
            intents,
            ledger,
            gateway,
            audit,
            bookings,
            clock,
            trip_id,
            stops,
            lounge_id,
            coffee_id,
        }
    }

    fn bus(&self, seats: &[&str]) -> BusSelection {
        BusSelection {
            trip_id: self.trip_id,
            boarding_stop_id: self.stops[0],
            alighting_stop_id: self.stops[2],
            seats: seats
                .iter()
                .enumerate()
                .map(|(i, s)| SeatSelection {
                    seat_id: s.to_string(),
                    passenger: PassengerInfo {
                        name: format!("Passenger {}", i + 1),
                        phone: Some(Masked::new("+94771234567".to_string())),
                        is_primary: i == 0,
                    },
                })
                .collect(),
        }
    }

    fn lounge(&self, guests: usize, start_hour: u32) -> LoungeSelection {
        LoungeSelection {
            lounge_id: self.lounge_id,
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            slot_start: NaiveTime::from_hms_opt(start_hour, 0, 0).unwrap(),
            slot_end: NaiveTime::from_hms_opt(start_hour + 2, 0, 0).unwrap(),
            pricing_type: LoungePricingType::TwoHours,
            guests: (0..guests)
                .map(|i| GuestInfo {
                    name: format!("Guest {}", i + 1),
                    phone: None,
                })
                .collect(),
            pre_orders: vec![],
        }
    }

    fn bus_only(&self, seats: &[&str]) -> IntentSelection {
        IntentSelection {
            intent_type: IntentType::BusOnly,
            bus: Some(self.bus(seats)),
            pre_trip_lounge: None,
            post_trip_lounge: None,
        }
    }

    fn combined(&self, seats: &[&str], guests: usize) -> IntentSelection {
        IntentSelection {
            intent_type: IntentType::Combined,
            bus: Some(self.bus(seats)),
            pre_trip_lounge: Some(self.lounge(guests, 8)),
            post_trip_lounge: None,
        }
    }

    fn slot(&self, start_hour: u32) -> SlotKey {
        SlotKey {
            lounge_id: self.lounge_id,
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            slot_start: NaiveTime::from_hms_opt(start_hour, 0, 0).unwrap(),
            slot_end: NaiveTime::from_hms_opt(start_hour + 2, 0, 0).unwrap(),
        }
    }

    fn seat(&self, seat_id: &str) -> Option<SeatState> {
        self.ledger.seat_state(self.trip_id, seat_id)
    }

    async fn deliver(&self, reference: &str) -> Result<WebhookOutcome, BookingError> {
        let (raw, signature) = self.gateway.callback_for(reference).unwrap();
        self.orchestrator.handle_webhook(Some(&signature), &raw).await
    }

    /// A sweeper that also resumes intents stuck in `confirming`.
    fn recovering_sweeper(&self, grace: Duration) -> IntentSweeper {
        IntentSweeper::new(self.intents.clone(), self.ledger.clone(), self.clock.clone(), 100)
            .with_confirmation_recovery(self.orchestrator.clone(), grace)
    }

    async fn stored(&self, intent_id: Uuid) -> BookingIntent {
        self.intents.get(intent_id).await.unwrap().unwrap()
    }

    fn events(&self, intent_id: Uuid) -> Vec<PaymentAuditEvent> {
        self.audit
            .all()
            .into_iter()
            .filter(|a| a.intent_id == intent_id)
            .map(|a| a.event)
            .collect()
    }
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_combined_booking_happy_path() {
    let h = Harness::new();
    let user = Uuid::new_v4();

    let created = h
        .orchestrator
        .create_intent(user, h.combined(&["A1", "A2"], 2), Some("trip-1"))
        .await
        .unwrap();
    let intent = created.intent;
    assert!(!created.replayed);
    assert_eq!(intent.status, IntentStatus::Held);
    assert_eq!(intent.pricing.total, 3000.0);
    assert_eq!(intent.expires_at, start() + Duration::minutes(10));
    assert!(matches!(h.seat("A1"), Some(SeatState::Held { intent_id, .. }) if intent_id == intent.id));
    assert_eq!(h.ledger.slot_usage(&h.slot(8)), Some((2, 3)));

    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();
    assert_eq!(started.intent.status, IntentStatus::PaymentPending);
    assert_eq!(started.intent.expires_at, start() + Duration::minutes(15));
    assert!(started.intent.ttl_extended);

    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    let outcome = h.deliver(&started.session.reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Confirmed { intent_id: intent.id });

    let confirmed = h.stored(intent.id).await;
    assert_eq!(confirmed.status, IntentStatus::Confirmed);
    let result = confirmed.result.unwrap();
    assert!(result.bus_booking_id.is_some());
    assert!(result.pre_trip_lounge_booking_id.is_some());
    assert_eq!(h.bookings.booking_for(intent.id), Some(result));
    assert!(matches!(h.seat("A2"), Some(SeatState::Booked { .. })));
    assert_eq!(
        h.ledger.lounge_hold_status(intent.id, &h.slot(8)),
        Some(LoungeHoldStatus::Confirmed)
    );

    let events = h.events(intent.id);
    assert!(events.contains(&PaymentAuditEvent::Initiated));
    assert!(events.contains(&PaymentAuditEvent::WebhookReceived));
    assert!(events.contains(&PaymentAuditEvent::Success));
    let success = h
        .audit
        .all()
        .into_iter()
        .find(|a| a.event == PaymentAuditEvent::Success)
        .unwrap();
    assert_eq!(success.amounts_match, Some(true));

    // The gateway retries the same callback
    let again = h.deliver(&started.session.reference).await.unwrap();
    assert_eq!(
        again,
        WebhookOutcome::AlreadyProcessed {
            intent_id: intent.id,
            status: IntentStatus::Confirmed
        }
    );
    assert_eq!(h.bookings.count(), 1);
}

#[tokio::test]
async fn test_partial_availability_holds_nothing() {
    let h = Harness::new();
    let rival = Uuid::new_v4();
    h.orchestrator
        .create_intent(rival, h.bus_only(&["A2"]), None)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .create_intent(Uuid::new_v4(), h.combined(&["A1", "A2"], 2), None)
        .await
        .unwrap_err();

    let BookingError::PartialAvailability(report) = err else {
        panic!("expected partial availability, got {err:?}");
    };
    let bus = report.leg(BookingLeg::Bus).unwrap();
    assert_eq!(bus.reason, UnavailableReason::SeatsTaken);
    assert_eq!(bus.seats, vec!["A2".to_string()]);
    assert!(bus.alternatives.contains(&"A1".to_string()));
    assert!(!bus.alternatives.contains(&"A2".to_string()));
    assert!(report.leg(BookingLeg::PreTripLounge).is_none());

    assert_eq!(h.seat("A1"), Some(SeatState::Available));
    assert_eq!(h.ledger.slot_usage(&h.slot(8)), Some((0, 3)));
    assert_eq!(h.intents.count(), 1);
}

#[tokio::test]
async fn test_full_lounge_reports_remaining_guests() {
    let h = Harness::new();
    h.orchestrator
        .create_intent(Uuid::new_v4(), h.combined(&["A1"], 2), None)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .create_intent(Uuid::new_v4(), h.combined(&["A3"], 2), None)
        .await
        .unwrap_err();
    let BookingError::PartialAvailability(report) = err else {
        panic!("expected partial availability");
    };
    let lounge = report.leg(BookingLeg::PreTripLounge).unwrap();
    assert_eq!(lounge.reason, UnavailableReason::FullyBooked);
    assert_eq!(lounge.requested_guests, Some(2));
    assert_eq!(lounge.available_guests, Some(1));
    assert_eq!(h.seat("A3"), Some(SeatState::Available));
}

#[tokio::test]
async fn test_expired_hold_is_swept_and_cannot_be_confirmed() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.combined(&["A1"], 1), None)
        .await
        .unwrap()
        .intent;

    h.clock.advance(Duration::minutes(11));
    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.released, 1);

    let expired = h.stored(intent.id).await;
    assert_eq!(expired.status, IntentStatus::Expired);
    assert!(expired.capacity_released);
    assert_eq!(h.seat("A1"), Some(SeatState::Available));
    assert_eq!(h.ledger.slot_usage(&h.slot(8)), Some((0, 3)));

    assert!(matches!(
        h.orchestrator.initiate_payment(user, intent.id).await,
        Err(BookingError::StateConflict { status: IntentStatus::Expired, .. })
    ));
    assert!(matches!(
        h.orchestrator.confirm_booking(user, intent.id, None).await,
        Err(BookingError::StateConflict { .. })
    ));

    // Nothing left to do on the next pass
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn test_payment_after_sweep_is_flagged_not_confirmed() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    h.clock.advance(Duration::minutes(16));
    h.sweeper.sweep_once().await.unwrap();

    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    let outcome = h.deliver(&started.session.reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Escalated { intent_id: intent.id });

    let stored = h.stored(intent.id).await;
    assert_eq!(stored.status, IntentStatus::Expired);
    assert!(stored.result.is_none());
    assert!(h.events(intent.id).contains(&PaymentAuditEvent::ReconciliationMismatch));
    assert_eq!(h.bookings.count(), 0);
}

#[tokio::test]
async fn test_payment_after_unswept_expiry_needs_refund() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    h.clock.advance(Duration::minutes(16));
    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    assert!(matches!(
        h.deliver(&started.session.reference).await.unwrap(),
        WebhookOutcome::Escalated { .. }
    ));

    let failed = h.stored(intent.id).await;
    assert_eq!(failed.status, IntentStatus::ConfirmationFailed);
    assert_eq!(failed.failure_reason.as_deref(), Some("payment_after_expiry"));
    assert_eq!(failed.payment.paid_amount, Some(1000.0));

    // The sweeper leaves confirmation failures alone
    assert_eq!(h.sweeper.sweep_once().await.unwrap().expired, 0);

    let refunded = h.orchestrator.initiate_refund(intent.id).await.unwrap();
    assert_eq!(refunded.status, IntentStatus::Refunded);
    assert!(refunded.payment.refund_id.is_some());
    assert!(refunded.capacity_released);
    assert_eq!(h.seat("A1"), Some(SeatState::Available));
}

#[tokio::test]
async fn test_amount_mismatch_is_escalated() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1", "A2"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, Some(1999.0));
    let outcome = h.deliver(&started.session.reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Escalated { intent_id: intent.id });

    let stored = h.stored(intent.id).await;
    assert_eq!(stored.status, IntentStatus::ConfirmationFailed);
    assert_eq!(stored.failure_reason.as_deref(), Some("amount_mismatch"));

    let mismatch = h
        .audit
        .all()
        .into_iter()
        .find(|a| a.event == PaymentAuditEvent::ReconciliationMismatch)
        .unwrap();
    assert_eq!(mismatch.expected_amount, Some(2000.0));
    assert_eq!(mismatch.received_amount, Some(1999.0));
    assert_eq!(mismatch.amounts_match, Some(false));
}

#[tokio::test]
async fn test_amount_within_tolerance_confirms() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, Some(1000.005));
    let confirmed = h
        .orchestrator
        .confirm_booking(user, intent.id, Some(&started.session.reference))
        .await
        .unwrap();
    assert_eq!(confirmed.status, IntentStatus::Confirmed);
}

// ============================================================================
// Idempotency and concurrency
// ============================================================================

#[tokio::test]
async fn test_idempotency_key_replays_open_intent() {
    let h = Harness::new();
    let user = Uuid::new_v4();

    let first = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), Some("k-1"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), Some("k-1"))
        .await
        .unwrap();
    assert!(second.replayed);
    assert_eq!(first.intent.id, second.intent.id);
    assert_eq!(h.intents.count(), 1);

    // A terminal intent frees the key
    h.orchestrator
        .cancel_intent(user, first.intent.id, None)
        .await
        .unwrap();
    let third = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), Some("k-1"))
        .await
        .unwrap();
    assert!(!third.replayed);
    assert_ne!(third.intent.id, first.intent.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_on_one_seat_have_one_winner() {
    let h = Harness::new();
    let selection = h.bus_only(&["A4"]);

    let mut handles = Vec::new();
    for _ in 0..12 {
        let orchestrator = h.orchestrator.clone();
        let selection = selection.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.create_intent(Uuid::new_v4(), selection, None).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(BookingError::PartialAvailability(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.intents.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_creates_one_intent() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let selection = h.bus_only(&["A3"]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        let selection = selection.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.create_intent(user, selection, Some("double-click")).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let created = handle.await.unwrap().expect("every same-key request resolves to the intent");
        ids.push(created.intent.id);
    }
    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(h.intents.count(), 1);
    assert!(matches!(h.seat("A3"), Some(SeatState::Held { intent_id, .. }) if intent_id == ids[0]));
}

#[tokio::test]
async fn test_same_key_waits_for_in_flight_insert() {
    let h = Harness::new();
    h.intents.delay_inserts(std::time::Duration::from_millis(50));
    let user = Uuid::new_v4();
    let selection = h.bus_only(&["A2"]);

    let first = {
        let orchestrator = h.orchestrator.clone();
        let selection = selection.clone();
        tokio::spawn(async move { orchestrator.create_intent(user, selection, Some("slow-network")).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // The first request holds A2 and is still writing its intent.
    let second = h
        .orchestrator
        .create_intent(user, selection, Some("slow-network"))
        .await
        .unwrap();
    let first = first.await.unwrap().unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.intent.id, first.intent.id);
    assert_eq!(h.intents.count(), 1);
    assert!(matches!(h.seat("A2"), Some(SeatState::Held { intent_id, .. }) if intent_id == first.intent.id));
}

// ============================================================================
// Confirmation, cancellation and lounges
// ============================================================================

#[tokio::test]
async fn test_confirm_requires_captured_payment() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    assert!(matches!(
        h.orchestrator.confirm_booking(user, intent.id, None).await,
        Err(BookingError::StateConflict { .. })
    ));

    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();
    assert!(matches!(
        h.orchestrator.confirm_booking(user, intent.id, None).await,
        Err(BookingError::PaymentIncomplete(PaymentStatus::Pending))
    ));
    assert_eq!(h.stored(intent.id).await.status, IntentStatus::PaymentPending);

    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    let confirmed = h.orchestrator.confirm_booking(user, intent.id, None).await.unwrap();
    assert_eq!(confirmed.status, IntentStatus::Confirmed);

    let again = h.orchestrator.confirm_booking(user, intent.id, None).await.unwrap();
    assert_eq!(again.result, confirmed.result);

    let late_webhook = h.deliver(&started.session.reference).await.unwrap();
    assert!(matches!(late_webhook, WebhookOutcome::AlreadyProcessed { .. }));
    assert_eq!(h.bookings.count(), 1);
}

#[tokio::test]
async fn test_browser_return_confirms_by_reference() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A2"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    let pending = h
        .orchestrator
        .confirm_by_reference(&started.session.reference)
        .await
        .unwrap();
    assert_eq!(pending.status, IntentStatus::PaymentPending);

    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    let confirmed = h
        .orchestrator
        .confirm_by_reference(&started.session.reference)
        .await
        .unwrap();
    assert_eq!(confirmed.status, IntentStatus::Confirmed);

    assert!(matches!(
        h.orchestrator.confirm_by_reference("TRN-NOPE").await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn test_cancel_releases_and_is_idempotent() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.combined(&["A1"], 3), None)
        .await
        .unwrap()
        .intent;

    let cancelled = h
        .orchestrator
        .cancel_intent(user, intent.id, Some("changed plans".to_string()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, IntentStatus::Cancelled);
    assert!(cancelled.capacity_released);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed plans"));
    assert_eq!(h.seat("A1"), Some(SeatState::Available));
    assert_eq!(h.ledger.slot_usage(&h.slot(8)), Some((0, 3)));

    let again = h.orchestrator.cancel_intent(user, intent.id, None).await.unwrap();
    assert_eq!(again.status, IntentStatus::Cancelled);
    assert_eq!(again.version, cancelled.version);
}

#[tokio::test]
async fn test_cancel_after_sweep_is_a_no_op() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    h.clock.advance(Duration::minutes(10));
    h.sweeper.sweep_once().await.unwrap();

    let result = h.orchestrator.cancel_intent(user, intent.id, None).await.unwrap();
    assert_eq!(result.status, IntentStatus::Expired);
}

#[tokio::test]
async fn test_failed_release_is_retried_by_sweeper() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    h.ledger.fail_releases(true);
    let cancelled = h.orchestrator.cancel_intent(user, intent.id, None).await.unwrap();
    assert_eq!(cancelled.status, IntentStatus::Cancelled);
    assert!(!cancelled.capacity_released);
    assert!(matches!(h.seat("A1"), Some(SeatState::Held { .. })));

    h.ledger.fail_releases(false);
    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(h.seat("A1"), Some(SeatState::Available));
    assert!(h.stored(intent.id).await.capacity_released);
}

#[tokio::test]
async fn test_add_lounge_upgrades_bus_only_intent() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    let mut lounge = h.lounge(2, 14);
    lounge.pre_orders.push(PreOrderLine {
        product_id: h.coffee_id,
        quantity: 2,
    });
    let updated = h
        .orchestrator
        .add_lounge_to_intent(user, intent.id, LoungeLeg::PostTrip, lounge)
        .await
        .unwrap();

    assert_eq!(updated.intent_type, IntentType::Combined);
    assert_eq!(updated.pricing.total, 1000.0 + 1000.0 + 300.0);
    assert_eq!(updated.version, intent.version + 1);
    assert_eq!(h.ledger.slot_usage(&h.slot(14)), Some((2, 3)));

    // The same leg cannot be added twice
    assert!(matches!(
        h.orchestrator
            .add_lounge_to_intent(user, intent.id, LoungeLeg::PostTrip, h.lounge(1, 16))
            .await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn test_add_lounge_without_capacity_leaves_intent_unchanged() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    let err = h
        .orchestrator
        .add_lounge_to_intent(user, intent.id, LoungeLeg::PreTrip, h.lounge(4, 8))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::PartialAvailability(_)));

    let stored = h.stored(intent.id).await;
    assert_eq!(stored.intent_type, IntentType::BusOnly);
    assert_eq!(stored.version, intent.version);
    assert_eq!(h.ledger.slot_usage(&h.slot(8)), Some((0, 3)));

    h.orchestrator.initiate_payment(user, intent.id).await.unwrap();
    assert!(matches!(
        h.orchestrator
            .add_lounge_to_intent(user, intent.id, LoungeLeg::PreTrip, h.lounge(1, 8))
            .await,
        Err(BookingError::StateConflict { .. })
    ));
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn test_commit_failure_then_refund_workflow() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.combined(&["A1"], 1), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    h.ledger.fail_commits(true);
    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    assert!(matches!(
        h.orchestrator.confirm_booking(user, intent.id, None).await,
        Err(BookingError::Reconciliation { .. })
    ));
    let failed = h.stored(intent.id).await;
    assert_eq!(failed.status, IntentStatus::ConfirmationFailed);
    assert!(failed.result.is_none());

    h.gateway.settle_refunds(false);
    let pending = h.orchestrator.initiate_refund(intent.id).await.unwrap();
    assert_eq!(pending.status, IntentStatus::RefundInitiated);
    assert!(pending.capacity_released);
    assert_eq!(h.seat("A1"), Some(SeatState::Available));

    let refunded = h.orchestrator.complete_refund(intent.id).await.unwrap();
    assert_eq!(refunded.status, IntentStatus::Refunded);

    let events = h.events(intent.id);
    assert!(events.contains(&PaymentAuditEvent::RefundInitiated));
    assert!(events.contains(&PaymentAuditEvent::RefundCompleted));
}

#[tokio::test]
async fn test_booking_write_failure_marks_confirmation_failed() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();

    h.bookings.fail_writes(true);
    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    let outcome = h.deliver(&started.session.reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Escalated { intent_id: intent.id });
    assert_eq!(h.stored(intent.id).await.status, IntentStatus::ConfirmationFailed);
}

#[tokio::test]
async fn test_redelivered_webhook_resumes_stuck_confirmation() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();
    let reference = started.session.reference;

    // Commit fails and so does recording the failure.
    h.ledger.fail_commits(true);
    h.intents.fail_next_write_to(IntentStatus::ConfirmationFailed);
    h.gateway.complete(&reference, PaymentStatus::Succeeded, None);
    let outcome = h.deliver(&reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Escalated { intent_id: intent.id });
    assert_eq!(h.stored(intent.id).await.status, IntentStatus::Confirming);

    h.ledger.fail_commits(false);
    let outcome = h.deliver(&reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Confirmed { intent_id: intent.id });

    let confirmed = h.stored(intent.id).await;
    assert_eq!(confirmed.status, IntentStatus::Confirmed);
    assert!(confirmed.result.is_some());
    assert_eq!(h.seat("A1"), Some(SeatState::Booked { intent_id: intent.id }));
    assert_eq!(h.bookings.count(), 1);
}

#[tokio::test]
async fn test_sweeper_resumes_confirmation_after_lost_write() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.combined(&["A2"], 1), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();
    let reference = started.session.reference;

    h.intents.fail_next_write_to(IntentStatus::Confirmed);
    h.gateway.complete(&reference, PaymentStatus::Succeeded, None);
    assert!(matches!(h.deliver(&reference).await, Err(BookingError::Storage(_))));
    assert_eq!(h.stored(intent.id).await.status, IntentStatus::Confirming);
    assert_eq!(h.bookings.count(), 1);

    let sweeper = h.recovering_sweeper(Duration::minutes(2));
    assert_eq!(sweeper.sweep_once().await.unwrap(), SweepReport::default());
    assert_eq!(h.stored(intent.id).await.status, IntentStatus::Confirming);

    h.clock.advance(Duration::minutes(3));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.failed, 0);

    let confirmed = h.stored(intent.id).await;
    assert_eq!(confirmed.status, IntentStatus::Confirmed);
    assert_eq!(h.seat("A2"), Some(SeatState::Booked { intent_id: intent.id }));
    assert_eq!(h.bookings.count(), 1);

    // Already terminal: nothing left to recover.
    assert_eq!(sweeper.sweep_once().await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn test_sweeper_leaves_confirming_and_confirmed_intents_alone() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let stuck = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let booked = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A2"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, booked.id).await.unwrap();
    h.gateway
        .complete(&started.session.reference, PaymentStatus::Succeeded, None);
    h.deliver(&started.session.reference).await.unwrap();

    h.clock.advance(Duration::minutes(30));
    let mut confirming = h.stored(stuck.id).await;
    let version = confirming.version;
    confirming.transition(IntentStatus::Confirming, h.clock.now()).unwrap();
    assert!(h.intents.replace(&confirming, version).await.unwrap());
    assert!(h.stored(stuck.id).await.is_expired(h.clock.now()));
    assert!(h.stored(booked.id).await.is_expired(h.clock.now()));

    assert_eq!(h.sweeper.sweep_once().await.unwrap(), SweepReport::default());

    assert_eq!(h.stored(stuck.id).await.status, IntentStatus::Confirming);
    assert_eq!(h.stored(booked.id).await.status, IntentStatus::Confirmed);
    assert!(matches!(h.seat("A1"), Some(SeatState::Held { intent_id, .. }) if intent_id == stuck.id));
    assert_eq!(h.seat("A2"), Some(SeatState::Booked { intent_id: booked.id }));
}

#[tokio::test]
async fn test_refund_requires_failed_confirmation() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    assert!(matches!(
        h.orchestrator.initiate_refund(intent.id).await,
        Err(BookingError::StateConflict { .. })
    ));
}

#[tokio::test]
async fn test_gateway_outage_leaves_intent_held() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    h.gateway.set_unavailable(true);
    assert!(matches!(
        h.orchestrator.initiate_payment(user, intent.id).await,
        Err(BookingError::Gateway(GatewayError::Unavailable(_)))
    ));
    let stored = h.stored(intent.id).await;
    assert_eq!(stored.status, IntentStatus::Held);
    assert!(!stored.ttl_extended);
    assert!(h.events(intent.id).contains(&PaymentAuditEvent::Failure));
}

#[tokio::test]
async fn test_webhook_authentication_and_failures() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(user, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;
    let started = h.orchestrator.initiate_payment(user, intent.id).await.unwrap();
    let reference = started.session.reference.clone();

    h.gateway.complete(&reference, PaymentStatus::Failed, None);
    let (raw, _) = h.gateway.callback_for(&reference).unwrap();
    assert!(matches!(
        h.orchestrator.handle_webhook(Some("00ff"), &raw).await,
        Err(BookingError::Gateway(GatewayError::InvalidSignature))
    ));

    // Retryable failure keeps the intent open
    let outcome = h.deliver(&reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::PaymentFailed { intent_id: intent.id });
    let stored = h.stored(intent.id).await;
    assert_eq!(stored.status, IntentStatus::PaymentPending);
    assert_eq!(stored.payment.last_status, Some(PaymentStatus::Failed));

    // A terminal failure cancels it
    h.gateway
        .complete_with_code(&reference, PaymentStatus::Failed, None, Some("fraud_suspected"));
    let outcome = h.deliver(&reference).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Cancelled { intent_id: intent.id });
    assert_eq!(h.seat("A1"), Some(SeatState::Available));

    let unknown = serde_json::to_vec(&serde_json::json!({
        "reference": "TRN-UNKNOWN",
        "amount": 10.0,
        "status": "SUCCEEDED"
    }))
    .unwrap();
    let signature = h.gateway.sign(&unknown);
    assert_eq!(
        h.orchestrator.handle_webhook(Some(&signature), &unknown).await.unwrap(),
        WebhookOutcome::Ignored
    );
}

#[tokio::test]
async fn test_route_and_departure_checks() {
    let h = Harness::new();

    let mut reversed = h.bus_only(&["A1"]);
    if let Some(bus) = reversed.bus.as_mut() {
        bus.boarding_stop_id = h.stops[2];
        bus.alighting_stop_id = h.stops[0];
    }
    assert!(matches!(
        h.orchestrator.create_intent(Uuid::new_v4(), reversed, None).await,
        Err(BookingError::Validation(_))
    ));

    assert!(matches!(
        h.orchestrator
            .create_intent(Uuid::new_v4(), h.bus_only(&["Z9"]), None)
            .await,
        Err(BookingError::Validation(_))
    ));

    h.clock.advance(Duration::hours(7));
    let err = h
        .orchestrator
        .create_intent(Uuid::new_v4(), h.bus_only(&["A1"]), None)
        .await
        .unwrap_err();
    let BookingError::PartialAvailability(report) = err else {
        panic!("expected departed trip to be unavailable");
    };
    assert_eq!(
        report.leg(BookingLeg::Bus).map(|l| l.reason),
        Some(UnavailableReason::TripDeparted)
    );
}

#[tokio::test]
async fn test_intents_are_private_to_their_owner() {
    let h = Harness::new();
    let owner = Uuid::new_v4();
    let intent = h
        .orchestrator
        .create_intent(owner, h.bus_only(&["A1"]), None)
        .await
        .unwrap()
        .intent;

    let stranger = Uuid::new_v4();
    assert!(matches!(
        h.orchestrator.get_intent(stranger, intent.id).await,
        Err(BookingError::Forbidden)
    ));
    assert!(matches!(
        h.orchestrator.cancel_intent(stranger, intent.id, None).await,
        Err(BookingError::Forbidden)
    ));
    assert!(matches!(
        h.orchestrator.get_intent(owner, Uuid::new_v4()).await,
        Err(BookingError::NotFound(_))
    ));
}
