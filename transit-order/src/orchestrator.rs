use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use transit_catalog::PricingEngine;
use transit_core::audit::{amounts_match, PaymentAudit, PaymentAuditBuilder, PaymentAuditEvent, PaymentAuditLog};
use transit_core::capacity::{CapacityLedger, CapacityRef, Denial, DenialReason};
use transit_core::clock::Clock;
use transit_core::intent::{
    BookingIntent, BusSelection, IntentPayload, IntentSelection, IntentStatus, LoungeLeg, LoungeSelection,
    PriceSnapshot,
};
use transit_core::inventory::{InventoryProvider, LoungeListing, TripListing};
use transit_core::payment::{PaymentGateway, PaymentSession, PaymentStatus};
use transit_core::repository::{BookingWriter, InsertOutcome, IntentRepository, KeyClaim, PaymentReference};
use uuid::Uuid;

use crate::error::{AvailabilityReport, BookingError, BookingLeg, LegAvailability, UnavailableReason};
use crate::reservation::{self, HoldGroup};
use crate::validation;

/// Tunables the orchestrator reads on every call.
#[derive(Debug, Clone)]
pub struct OrchestratorRules {
    pub intent_ttl: Duration,
    /// Granted once, on the first payment initiation.
    pub payment_extension: Duration,
    pub max_seats: usize,
    pub alternatives_limit: usize,
    /// A key claim with no intent behind it is abandoned after this long.
    pub key_claim_ttl: Duration,
    /// How long a request waits on another in-flight request with its key.
    pub key_wait: std::time::Duration,
}

impl Default for OrchestratorRules {
    fn default() -> Self {
        Self {
            intent_ttl: Duration::minutes(10),
            payment_extension: Duration::minutes(5),
            max_seats: 10,
            alternatives_limit: 5,
            key_claim_ttl: Duration::seconds(30),
            key_wait: std::time::Duration::from_secs(5),
        }
    }
}

/// Everything the orchestrator talks to. Each seam is a trait object so the
/// Postgres and in-memory implementations are interchangeable.
#[derive(Clone)]
pub struct Collaborators {
    pub intents: Arc<dyn IntentRepository>,
    pub ledger: Arc<dyn CapacityLedger>,
    pub inventory: Arc<dyn InventoryProvider>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub audit: Arc<dyn PaymentAuditLog>,
    pub bookings: Arc<dyn BookingWriter>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct CreatedIntent {
    pub intent: BookingIntent,
    /// True when an open intent with the same idempotency key was returned.
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct PaymentStart {
    pub intent: BookingIntent,
    pub session: PaymentSession,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Confirmed { intent_id: Uuid },
    AlreadyProcessed { intent_id: Uuid, status: IntentStatus },
    PaymentFailed { intent_id: Uuid },
    Cancelled { intent_id: Uuid },
    Pending { intent_id: Uuid },
    Refunded { intent_id: Uuid },
    /// Money was taken but the intent could not be confirmed.
    Escalated { intent_id: Uuid },
    Ignored,
}

/// A payment the gateway has reported as captured.
#[derive(Debug, Clone)]
struct VerifiedPayment {
    reference: String,
    gateway_uid: Option<String>,
    amount: Option<f64>,
}

/// Drives booking intents from hold to confirmation.
///
/// Every status change is a compare-and-swap on the intent version, so a
/// cancel, a sweep and a payment racing on one intent resolve to exactly one
/// winner. Capacity is only touched after the status write that justifies it.
pub struct BookingOrchestrator {
    intents: Arc<dyn IntentRepository>,
    ledger: Arc<dyn CapacityLedger>,
    inventory: Arc<dyn InventoryProvider>,
    gateway: Arc<dyn PaymentGateway>,
    audit: Arc<dyn PaymentAuditLog>,
    bookings: Arc<dyn BookingWriter>,
    clock: Arc<dyn Clock>,
    pricing: PricingEngine,
    rules: OrchestratorRules,
}

fn conflict(intent: &BookingIntent, reason: impl Into<String>) -> BookingError {
    BookingError::StateConflict {
        intent_id: intent.id,
        status: intent.status,
        reason: reason.into(),
    }
}

fn advance(intent: &mut BookingIntent, to: IntentStatus, now: DateTime<Utc>) -> Result<(), BookingError> {
    let intent_id = intent.id;
    intent.transition(to, now).map_err(|e| BookingError::StateConflict {
        intent_id,
        status: e.from,
        reason: e.to_string(),
    })
}

fn apply_payment(intent: &mut BookingIntent, payment: &VerifiedPayment) {
    intent.payment.last_status = Some(PaymentStatus::Succeeded);
    intent.payment.gateway_reference = Some(payment.reference.clone());
    if let Some(uid) = &payment.gateway_uid {
        intent.payment.gateway_uid = Some(uid.clone());
    }
    intent.payment.paid_amount = payment.amount;
}

const KEY_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

fn new_reference() -> String {
    format!("TRN-{}", Uuid::new_v4().simple().to_string().to_uppercase())
}

impl BookingOrchestrator {
    pub fn new(collaborators: Collaborators, pricing: PricingEngine, rules: OrchestratorRules) -> Self {
        Self {
            intents: collaborators.intents,
            ledger: collaborators.ledger,
            inventory: collaborators.inventory,
            gateway: collaborators.gateway,
            audit: collaborators.audit,
            bookings: collaborators.bookings,
            clock: collaborators.clock,
            pricing,
            rules,
        }
    }

    pub fn rules(&self) -> &OrchestratorRules {
        &self.rules
    }

    // ------------------------------------------------------------------
    // CreateIntent
    // ------------------------------------------------------------------

    /// Validates, prices and holds every requested sub-booking. Either all
    /// legs are held and an intent is persisted, or nothing stays held and
    /// the caller gets a per-leg availability report.
    pub async fn create_intent(
        &self,
        user_id: Uuid,
        selection: IntentSelection,
        idempotency_key: Option<&str>,
    ) -> Result<CreatedIntent, BookingError> {
        let key = idempotency_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        if let Some(existing) = self.replay(user_id, key.as_deref()).await? {
            return Ok(CreatedIntent {
                intent: existing,
                replayed: true,
            });
        }

        let payload = validation::validate_selection(selection, self.rules.max_seats)?;
        let now = self.clock.now();

        let trip = match payload.bus() {
            Some(bus) => Some(self.trip_for(bus).await?),
            None => None,
        };
        let mut lounges = Vec::new();
        for (_, selection) in payload.lounge_legs() {
            lounges.push(self.lounge_for(selection.lounge_id).await?);
        }
        let pricing = {
            let legs: Vec<(LoungeLeg, &LoungeSelection, &LoungeListing)> = payload
                .lounge_legs()
                .into_iter()
                .zip(lounges.iter())
                .map(|((leg, selection), listing)| (leg, selection, listing))
                .collect();
            self.pricing.snapshot(payload.bus().zip(trip.as_ref()), &legs)?
        };

        let intent_id = Uuid::new_v4();
        if let Some(key) = key.as_deref() {
            if let Some(existing) = self.claim_key(user_id, key, intent_id).await? {
                return Ok(CreatedIntent {
                    intent: existing,
                    replayed: true,
                });
            }
        }

        let held_until = now + self.rules.intent_ttl;
        let departed = trip.as_ref().is_some_and(|t| t.departure_at <= now);
        let mut unavailable = Vec::new();

        for group in reservation::hold_groups(&payload) {
            if group.leg == BookingLeg::Bus && departed {
                unavailable.push(LegAvailability {
                    leg: BookingLeg::Bus,
                    reason: UnavailableReason::TripDeparted,
                    seats: payload.bus().map(|b| b.seat_ids()).unwrap_or_default(),
                    requested_guests: None,
                    available_guests: None,
                    alternatives: Vec::new(),
                });
                continue;
            }

            match reservation::hold_group(self.ledger.as_ref(), &group, intent_id, held_until).await {
                Ok(Ok(())) => {}
                Ok(Err(denials)) => unavailable.push(self.describe(&group, &denials).await),
                Err(e) => {
                    self.roll_back(user_id, intent_id, &payload, &pricing).await;
                    self.release_key(user_id, key.as_deref(), intent_id).await;
                    return Err(e.into());
                }
            }
        }

        if !unavailable.is_empty() {
            self.roll_back(user_id, intent_id, &payload, &pricing).await;
            self.release_key(user_id, key.as_deref(), intent_id).await;

            // A concurrent request with the same key may have won the capacity.
            if let Some(existing) = self.replay(user_id, key.as_deref()).await? {
                return Ok(CreatedIntent {
                    intent: existing,
                    replayed: true,
                });
            }

            info!(user_id = %user_id, legs = unavailable.len(), "Intent rejected: capacity unavailable");
            return Err(BookingError::PartialAvailability(AvailabilityReport { unavailable }));
        }

        let intent = BookingIntent::new(intent_id, user_id, key, payload, pricing, now, self.rules.intent_ttl);
        match self.intents.insert(&intent).await {
            Ok(InsertOutcome::Inserted) => {
                info!(
                    intent_id = %intent.id,
                    user_id = %user_id,
                    intent_type = intent.intent_type.as_str(),
                    total = intent.pricing.total,
                    "Intent created"
                );
                Ok(CreatedIntent {
                    intent,
                    replayed: false,
                })
            }
            Ok(InsertOutcome::Duplicate(existing)) => {
                self.roll_back(user_id, intent.id, &intent.payload, &intent.pricing).await;
                self.release_key(user_id, intent.idempotency_key.as_deref(), intent.id).await;
                Ok(CreatedIntent {
                    intent: existing,
                    replayed: true,
                })
            }
            Err(e) => {
                self.roll_back(user_id, intent.id, &intent.payload, &intent.pricing).await;
                self.release_key(user_id, intent.idempotency_key.as_deref(), intent.id).await;
                Err(e.into())
            }
        }
    }

    /// Claims `key` for `intent_id` before anything is held. While another
    /// request owns the key this waits for it to write its intent (returned
    /// as a replay) or give the key up.
    async fn claim_key(&self, user_id: Uuid, key: &str, intent_id: Uuid) -> Result<Option<BookingIntent>, BookingError> {
        let deadline = tokio::time::Instant::now() + self.rules.key_wait;
        loop {
            let now = self.clock.now();
            let claim = self
                .intents
                .claim_idempotency_key(user_id, key, intent_id, now, now - self.rules.key_claim_ttl)
                .await?;
            if claim == KeyClaim::Claimed {
                return Ok(None);
            }

            if let Some(existing) = self.replay(user_id, Some(key)).await? {
                return Ok(Some(existing));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(user_id = %user_id, "Idempotency key still claimed by an in-flight request");
                return Err(BookingError::KeyInUse);
            }
            tokio::time::sleep(KEY_POLL_INTERVAL).await;
        }
    }

    async fn release_key(&self, user_id: Uuid, key: Option<&str>, intent_id: Uuid) {
        let Some(key) = key else {
            return;
        };
        if let Err(e) = self.intents.release_idempotency_key(user_id, key, intent_id).await {
            warn!(user_id = %user_id, error = %e, "Failed to release idempotency key claim; it will go stale");
        }
    }

    async fn replay(&self, user_id: Uuid, key: Option<&str>) -> Result<Option<BookingIntent>, BookingError> {
        let Some(key) = key else {
            return Ok(None);
        };
        let existing = self.intents.find_by_idempotency_key(user_id, key).await?;
        if let Some(intent) = &existing {
            info!(intent_id = %intent.id, "Replaying intent for idempotency key");
        }
        Ok(existing)
    }

    async fn trip_for(&self, bus: &BusSelection) -> Result<TripListing, BookingError> {
        let trip = self
            .inventory
            .trip(bus.trip_id)
            .await?
            .ok_or_else(|| BookingError::Validation(format!("unknown trip {}", bus.trip_id)))?;

        let boarding = trip
            .stop_position(bus.boarding_stop_id)
            .ok_or_else(|| BookingError::Validation("boarding stop is not on this trip".into()))?;
        let alighting = trip
            .stop_position(bus.alighting_stop_id)
            .ok_or_else(|| BookingError::Validation("alighting stop is not on this trip".into()))?;
        if boarding >= alighting {
            return Err(BookingError::Validation(
                "boarding stop must come before alighting stop".into(),
            ));
        }

        if let Some(missing) = bus.seats.iter().find(|s| trip.seat(&s.seat_id).is_none()) {
            return Err(BookingError::Validation(format!(
                "seat {} does not exist on this trip",
                missing.seat_id
            )));
        }
        Ok(trip)
    }

    async fn lounge_for(&self, lounge_id: Uuid) -> Result<LoungeListing, BookingError> {
        self.inventory
            .lounge(lounge_id)
            .await?
            .ok_or_else(|| BookingError::Validation(format!("unknown lounge {}", lounge_id)))
    }

    async fn describe(&self, group: &HoldGroup, denials: &[Denial]) -> LegAvailability {
        if group.leg == BookingLeg::Bus {
            let seats = denials
                .iter()
                .filter_map(|d| match &d.unit {
                    CapacityRef::Seat { seat_id, .. } => Some(seat_id.clone()),
                    CapacityRef::LoungeSlot { .. } => None,
                })
                .collect();
            let trip_id = group.units.iter().find_map(|u| match u {
                CapacityRef::Seat { trip_id, .. } => Some(*trip_id),
                CapacityRef::LoungeSlot { .. } => None,
            });
            let alternatives = match trip_id {
                Some(trip_id) => self
                    .ledger
                    .available_seats(trip_id, self.rules.alternatives_limit)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(trip_id = %trip_id, error = %e, "Could not list alternative seats");
                        Vec::new()
                    }),
                None => Vec::new(),
            };
            return LegAvailability {
                leg: group.leg,
                reason: UnavailableReason::SeatsTaken,
                seats,
                requested_guests: None,
                available_guests: None,
                alternatives,
            };
        }

        let (requested, available) = denials
            .iter()
            .find_map(|d| match (&d.unit, &d.reason) {
                (_, DenialReason::SlotFull { requested, available }) => Some((*requested, *available)),
                (CapacityRef::LoungeSlot { guests, .. }, _) => Some((*guests, 0)),
                _ => None,
            })
            .unwrap_or((0, 0));

        LegAvailability {
            leg: group.leg,
            reason: UnavailableReason::FullyBooked,
            seats: Vec::new(),
            requested_guests: Some(requested),
            available_guests: Some(available),
            alternatives: Vec::new(),
        }
    }

    /// Releases whatever `intent_id` may hold. If the ledger refuses, a
    /// cancelled intent is parked so the sweeper keeps retrying the release.
    async fn roll_back(&self, user_id: Uuid, intent_id: Uuid, payload: &IntentPayload, pricing: &PriceSnapshot) {
        let units = reservation::all_units(payload);
        let Err(e) = self.ledger.release(&units, intent_id).await else {
            return;
        };
        error!(intent_id = %intent_id, error = %e, "Hold rollback failed; parking intent for release retry");

        let now = self.clock.now();
        let mut parked = BookingIntent::new(
            intent_id,
            user_id,
            None,
            payload.clone(),
            pricing.clone(),
            now,
            Duration::zero(),
        );
        if advance(&mut parked, IntentStatus::Cancelled, now).is_ok() {
            parked.cancellation_reason = Some("hold_rollback_failed".to_string());
            if let Err(e) = self.intents.insert(&parked).await {
                error!(intent_id = %intent_id, error = %e, "Failed to park intent; capacity needs manual release");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    async fn load(&self, intent_id: Uuid) -> Result<BookingIntent, BookingError> {
        self.intents
            .get(intent_id)
            .await?
            .ok_or(BookingError::NotFound(intent_id))
    }

    async fn owned(&self, user_id: Uuid, intent_id: Uuid) -> Result<BookingIntent, BookingError> {
        let intent = self.load(intent_id).await?;
        if intent.user_id != user_id {
            return Err(BookingError::Forbidden);
        }
        Ok(intent)
    }

    pub async fn get_intent(&self, user_id: Uuid, intent_id: Uuid) -> Result<BookingIntent, BookingError> {
        self.owned(user_id, intent_id).await
    }

    /// Operator lookup without the ownership check.
    pub async fn find_intent(&self, intent_id: Uuid) -> Result<BookingIntent, BookingError> {
        self.load(intent_id).await
    }

    pub async fn audit_trail(&self, intent_id: Uuid) -> Result<Vec<PaymentAudit>, BookingError> {
        self.load(intent_id).await?;
        Ok(self.audit.list_for_intent(intent_id).await?)
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    async fn save(&self, intent: &mut BookingIntent, expected_version: i64) -> Result<bool, BookingError> {
        if self.intents.replace(intent, expected_version).await? {
            intent.version = expected_version + 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn audit_for(&self, intent: &BookingIntent, event: PaymentAuditEvent) -> PaymentAuditBuilder {
        PaymentAudit::builder(intent.id, intent.user_id, event)
            .gateway(self.gateway.name())
            .expected(intent.pricing.total, intent.pricing.currency.clone())
    }

    async fn record(&self, audit: PaymentAudit) {
        if let Err(e) = self.audit.append(&audit).await {
            error!(
                intent_id = %audit.intent_id,
                event = audit.event.as_str(),
                error = %e,
                "Failed to write payment audit"
            );
        }
    }

    async fn release(&self, intent: BookingIntent) -> BookingIntent {
        let intent_id = intent.id;
        let fallback = intent.clone();
        match reservation::release_intent_capacity(
            self.ledger.as_ref(),
            self.intents.as_ref(),
            self.clock.as_ref(),
            intent,
        )
        .await
        {
            Ok(released) => released,
            Err(e) => {
                warn!(intent_id = %intent_id, error = %e, "Capacity release failed; sweeper will retry");
                fallback
            }
        }
    }

    // ------------------------------------------------------------------
    // InitiatePayment
    // ------------------------------------------------------------------

    /// Opens a gateway checkout under a fresh reference. The first call
    /// extends the hold once; gateway failures leave the intent untouched.
    pub async fn initiate_payment(&self, user_id: Uuid, intent_id: Uuid) -> Result<PaymentStart, BookingError> {
        let intent = self.owned(user_id, intent_id).await?;
        let now = self.clock.now();
        if !intent.can_initiate_payment(now) {
            let reason = if intent.status.is_open() {
                "hold has expired"
            } else {
                "payment can no longer be initiated"
            };
            return Err(conflict(&intent, reason));
        }

        let reference = new_reference();
        let amount = intent.pricing.total;
        let currency = intent.pricing.currency.clone();

        self.record(
            self.audit_for(&intent, PaymentAuditEvent::Initiated)
                .reference(Some(&reference))
                .request(json!({ "amount": amount, "currency": currency, "reference": reference }))
                .build(now),
        )
        .await;

        let session = match self.gateway.initiate_payment(amount, &currency, &reference).await {
            Ok(session) => session,
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "Payment initiation failed");
                self.record(
                    self.audit_for(&intent, PaymentAuditEvent::Failure)
                        .reference(Some(&reference))
                        .error(e.to_string())
                        .build(self.clock.now()),
                )
                .await;
                return Err(e.into());
            }
        };

        self.intents
            .record_payment_reference(&PaymentReference {
                reference: reference.clone(),
                intent_id: intent.id,
                gateway_uid: session.gateway_uid.clone(),
                status_token: session.status_token.clone(),
                created_at: now,
            })
            .await?;

        let mut next = intent.clone();
        if next.status == IntentStatus::Held {
            advance(&mut next, IntentStatus::PaymentPending, now)?;
        }
        next.payment.gateway_reference = Some(reference.clone());
        next.payment.gateway_uid = Some(session.gateway_uid.clone());
        next.payment.payment_url = Some(session.payment_url.clone());
        next.payment.last_status = Some(PaymentStatus::Pending);
        next.payment.initiated_at.get_or_insert(now);
        let extended = next.extend_ttl_once(self.rules.payment_extension);
        next.updated_at = now;

        if !self.save(&mut next, intent.version).await? {
            let current = self.load(intent.id).await?;
            return Err(conflict(&current, "intent changed while payment was being initiated"));
        }

        if extended {
            let units = reservation::all_units(&next.payload);
            if let Err(e) = self.ledger.extend(&units, next.id, next.expires_at).await {
                warn!(intent_id = %next.id, error = %e, "Failed to extend capacity holds");
            }
        }

        self.record(
            self.audit_for(&next, PaymentAuditEvent::GatewayResponse)
                .reference(Some(&reference))
                .gateway_uid(Some(&session.gateway_uid))
                .status(PaymentStatus::Pending)
                .response(json!({ "uid": session.gateway_uid, "payment_url": session.payment_url }))
                .build(now),
        )
        .await;

        info!(intent_id = %next.id, reference = %reference, expires_at = %next.expires_at, "Payment initiated");
        Ok(PaymentStart { intent: next, session })
    }

    // ------------------------------------------------------------------
    // Webhook
    // ------------------------------------------------------------------

    /// Applies an authenticated gateway callback. Duplicate deliveries are
    /// answered from the intent's current state.
    pub async fn handle_webhook(&self, signature: Option<&str>, raw: &[u8]) -> Result<WebhookOutcome, BookingError> {
        let event = match self.gateway.parse_webhook(signature, raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Rejected payment webhook");
                return Err(e.into());
            }
        };

        let Some(record) = self.intents.find_payment_reference(&event.reference).await? else {
            warn!(reference = %event.reference, "Webhook for unknown payment reference");
            return Ok(WebhookOutcome::Ignored);
        };
        let intent = self.load(record.intent_id).await?;
        let now = self.clock.now();

        self.record(
            self.audit_for(&intent, PaymentAuditEvent::WebhookReceived)
                .reference(Some(&event.reference))
                .gateway_uid(event.gateway_uid.as_deref())
                .status(event.status)
                .received(Some(event.amount))
                .request(event.raw.clone())
                .build(now),
        )
        .await;

        match event.status {
            PaymentStatus::Succeeded => {
                let was = intent.status;
                let payment = VerifiedPayment {
                    reference: event.reference.clone(),
                    gateway_uid: event.gateway_uid.clone().or(Some(record.gateway_uid.clone())),
                    amount: Some(event.amount),
                };
                match self.settle(intent, payment).await {
                    Ok(settled) if settled.status == IntentStatus::Confirmed && was != IntentStatus::Confirmed => {
                        Ok(WebhookOutcome::Confirmed { intent_id: settled.id })
                    }
                    Ok(settled) => Ok(WebhookOutcome::AlreadyProcessed {
                        intent_id: settled.id,
                        status: settled.status,
                    }),
                    Err(BookingError::Reconciliation { intent_id, .. }) => Ok(WebhookOutcome::Escalated { intent_id }),
                    Err(e) => Err(e),
                }
            }
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                // Failures for a superseded checkout say nothing about the current one.
                let current_attempt = intent.payment.gateway_reference.as_deref() == Some(event.reference.as_str());
                if !intent.status.is_open() || !current_attempt {
                    return Ok(WebhookOutcome::AlreadyProcessed {
                        intent_id: intent.id,
                        status: intent.status,
                    });
                }

                let code = event.failure_code.clone().unwrap_or_else(|| "unspecified".to_string());
                self.record(
                    self.audit_for(&intent, PaymentAuditEvent::Failure)
                        .reference(Some(&event.reference))
                        .gateway_uid(event.gateway_uid.as_deref())
                        .status(event.status)
                        .error(format!("payment failed: {}", code))
                        .build(now),
                )
                .await;

                if event.terminal {
                    let cancelled = self.cancel(intent, format!("payment_failed:{}", code)).await?;
                    return Ok(WebhookOutcome::Cancelled { intent_id: cancelled.id });
                }

                let mut next = intent.clone();
                next.payment.last_status = Some(event.status);
                next.updated_at = now;
                if !self.save(&mut next, intent.version).await? {
                    warn!(intent_id = %intent.id, "Intent changed while recording a failed payment");
                }
                info!(intent_id = %intent.id, code = %code, "Payment failed; customer may retry");
                Ok(WebhookOutcome::PaymentFailed { intent_id: intent.id })
            }
            PaymentStatus::Refunded if intent.status == IntentStatus::RefundInitiated => {
                let refunded = self.complete_refund(intent.id).await?;
                Ok(WebhookOutcome::Refunded { intent_id: refunded.id })
            }
            PaymentStatus::Pending | PaymentStatus::Refunded => Ok(WebhookOutcome::Pending { intent_id: intent.id }),
        }
    }

    // ------------------------------------------------------------------
    // ConfirmBooking
    // ------------------------------------------------------------------

    /// Confirms after re-verifying the payment with the gateway. The client's
    /// word is never trusted. Confirming an already confirmed intent returns it.
    pub async fn confirm_booking(
        &self,
        user_id: Uuid,
        intent_id: Uuid,
        payment_reference: Option<&str>,
    ) -> Result<BookingIntent, BookingError> {
        let intent = self.owned(user_id, intent_id).await?;
        match intent.status {
            IntentStatus::Confirmed => return Ok(intent),
            IntentStatus::Confirming => return Err(conflict(&intent, "confirmation already in progress")),
            status if !status.is_open() => return Err(conflict(&intent, "intent can no longer be confirmed")),
            _ => {}
        }

        let reference = match payment_reference
            .map(str::to_string)
            .or_else(|| intent.payment.gateway_reference.clone())
        {
            Some(reference) => reference,
            None => return Err(conflict(&intent, "payment has not been initiated")),
        };

        let record = self
            .intents
            .find_payment_reference(&reference)
            .await?
            .filter(|r| r.intent_id == intent.id)
            .ok_or_else(|| BookingError::Validation("payment reference does not belong to this intent".into()))?;

        self.verify_and_settle(intent, record).await
    }

    /// Browser return from checkout. Resolves the intent from our reference
    /// and confirms it if the gateway reports the payment captured.
    pub async fn confirm_by_reference(&self, reference: &str) -> Result<BookingIntent, BookingError> {
        let record = self
            .intents
            .find_payment_reference(reference)
            .await?
            .ok_or_else(|| BookingError::Validation("unknown payment reference".into()))?;
        let intent = self.load(record.intent_id).await?;
        if !intent.status.is_open() {
            return Ok(intent);
        }

        let intent_id = intent.id;
        match self.verify_and_settle(intent, record).await {
            Ok(intent) => Ok(intent),
            Err(BookingError::PaymentIncomplete(_)) | Err(BookingError::StateConflict { .. }) => {
                self.load(intent_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_and_settle(
        &self,
        intent: BookingIntent,
        record: PaymentReference,
    ) -> Result<BookingIntent, BookingError> {
        let check = match self.gateway.check_status(&record.status_token).await {
            Ok(check) => check,
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "Payment status check failed");
                self.record(
                    self.audit_for(&intent, PaymentAuditEvent::StatusCheck)
                        .reference(Some(&record.reference))
                        .error(e.to_string())
                        .build(self.clock.now()),
                )
                .await;
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        self.record(
            self.audit_for(&intent, PaymentAuditEvent::StatusCheck)
                .reference(Some(&record.reference))
                .gateway_uid(check.gateway_uid.as_deref())
                .status(check.status)
                .received(check.amount)
                .response(check.raw.clone())
                .build(now),
        )
        .await;

        if check.status != PaymentStatus::Succeeded {
            if intent.is_expired(now) {
                return Err(conflict(&intent, "hold expired before payment completed"));
            }
            return Err(BookingError::PaymentIncomplete(check.status));
        }

        let payment = VerifiedPayment {
            reference: record.reference,
            gateway_uid: check.gateway_uid.or(Some(record.gateway_uid)),
            amount: check.amount,
        };
        self.settle(intent, payment).await
    }

    /// Turns a captured payment into bookings. Once the intent is in
    /// `confirming` every failure lands in `confirmation_failed`.
    async fn settle(&self, intent: BookingIntent, payment: VerifiedPayment) -> Result<BookingIntent, BookingError> {
        let now = self.clock.now();
        match intent.status {
            IntentStatus::Held | IntentStatus::PaymentPending => {}
            IntentStatus::Expired | IntentStatus::Cancelled | IntentStatus::Refunded => {
                return Err(self.late_payment(&intent, &payment).await);
            }
            // An earlier attempt stopped before writing its outcome.
            IntentStatus::Confirming => return self.finish_confirmation(intent, &payment).await,
            _ => return Ok(intent),
        }

        if intent.is_expired(now) {
            return Err(self.escalate(intent, &payment, "payment_after_expiry").await);
        }
        match payment.amount {
            Some(received) if amounts_match(intent.pricing.total, received) => {}
            Some(_) => return Err(self.escalate(intent, &payment, "amount_mismatch").await),
            None => return Err(self.escalate(intent, &payment, "amount_not_reported").await),
        }

        let mut confirming = intent.clone();
        advance(&mut confirming, IntentStatus::Confirming, now)?;
        apply_payment(&mut confirming, &payment);
        if !self.save(&mut confirming, intent.version).await? {
            let current = self.load(intent.id).await?;
            return match current.status {
                IntentStatus::Expired | IntentStatus::Cancelled => Err(self.late_payment(&current, &payment).await),
                status if status.is_open() => Err(conflict(&current, "intent changed during confirmation; retry")),
                _ => Ok(current),
            };
        }

        self.record(
            self.audit_for(&confirming, PaymentAuditEvent::Success)
                .reference(Some(&payment.reference))
                .gateway_uid(payment.gateway_uid.as_deref())
                .status(PaymentStatus::Succeeded)
                .received(payment.amount)
                .build(now),
        )
        .await;

        self.finish_confirmation(confirming, &payment).await
    }

    /// Commits capacity, writes the bookings and records the outcome for an
    /// intent in `confirming`. Rerunnable: commit and booking creation are
    /// idempotent per intent.
    async fn finish_confirmation(
        &self,
        confirming: BookingIntent,
        payment: &VerifiedPayment,
    ) -> Result<BookingIntent, BookingError> {
        let now = self.clock.now();
        let units = reservation::all_units(&confirming.payload);
        if let Err(e) = self.ledger.commit(&units, confirming.id).await {
            return Err(self
                .fail_confirmation(confirming, payment, format!("capacity commit failed: {}", e))
                .await);
        }

        let result = match self.bookings.create_bookings(&confirming).await {
            Ok(result) if result.covers(&confirming.payload) => result,
            Ok(_) => {
                return Err(self
                    .fail_confirmation(confirming, payment, "booking result is missing a sub-booking".to_string())
                    .await)
            }
            Err(e) => {
                return Err(self
                    .fail_confirmation(confirming, payment, format!("booking creation failed: {}", e))
                    .await)
            }
        };

        let mut confirmed = confirming.clone();
        confirmed
            .mark_confirmed(result, now)
            .map_err(|e| conflict(&confirming, e.to_string()))?;

        match self.save(&mut confirmed, confirming.version).await {
            Ok(true) => {
                info!(
                    intent_id = %confirmed.id,
                    reference = %payment.reference,
                    total = confirmed.pricing.total,
                    "Booking confirmed"
                );
                Ok(confirmed)
            }
            Ok(false) => {
                let current = self.load(confirming.id).await?;
                if current.status == IntentStatus::Confirmed {
                    return Ok(current);
                }
                error!(intent_id = %confirming.id, status = %current.status, "Lost the confirmation write after bookings were created");
                Err(BookingError::Reconciliation {
                    intent_id: confirming.id,
                    reason: "confirmation write lost".to_string(),
                })
            }
            Err(e) => {
                error!(intent_id = %confirming.id, error = %e, "Bookings created but intent not marked confirmed; will resume");
                Err(e)
            }
        }
    }

    /// Picks up an intent left in `confirming` using the payment already
    /// recorded on it.
    pub async fn resume_confirmation(&self, intent: BookingIntent) -> Result<BookingIntent, BookingError> {
        if intent.status != IntentStatus::Confirming {
            return Ok(intent);
        }
        let payment = VerifiedPayment {
            reference: intent.payment.gateway_reference.clone().unwrap_or_default(),
            gateway_uid: intent.payment.gateway_uid.clone(),
            amount: intent.payment.paid_amount,
        };
        warn!(intent_id = %intent.id, reference = %payment.reference, "Resuming stalled confirmation");
        self.finish_confirmation(intent, &payment).await
    }

    /// Records a post-verification failure. Capacity stays held until the
    /// refund workflow releases it.
    async fn fail_confirmation(
        &self,
        confirming: BookingIntent,
        payment: &VerifiedPayment,
        reason: String,
    ) -> BookingError {
        let now = self.clock.now();
        let mut failed = confirming.clone();
        if let Err(e) = advance(&mut failed, IntentStatus::ConfirmationFailed, now) {
            return e;
        }
        failed.failure_reason = Some(reason.clone());

        match self.save(&mut failed, confirming.version).await {
            Ok(true) => {}
            Ok(false) => error!(intent_id = %confirming.id, "Intent changed while recording confirmation failure"),
            Err(e) => error!(
                intent_id = %confirming.id,
                error = %e,
                "Could not record confirmation failure; intent left in confirming"
            ),
        }

        self.record(
            self.audit_for(&confirming, PaymentAuditEvent::Failure)
                .reference(Some(&payment.reference))
                .gateway_uid(payment.gateway_uid.as_deref())
                .status(PaymentStatus::Succeeded)
                .received(payment.amount)
                .error(reason.clone())
                .build(now),
        )
        .await;

        error!(intent_id = %confirming.id, reason = %reason, "Confirmation failed after payment; refund required");
        BookingError::Reconciliation {
            intent_id: confirming.id,
            reason,
        }
    }

    /// A captured payment that cannot be honoured on an open intent.
    async fn escalate(&self, intent: BookingIntent, payment: &VerifiedPayment, reason: &str) -> BookingError {
        let now = self.clock.now();
        let mut failed = intent.clone();
        apply_payment(&mut failed, payment);
        if let Err(e) = advance(&mut failed, IntentStatus::Confirming, now)
            .and_then(|_| advance(&mut failed, IntentStatus::ConfirmationFailed, now))
        {
            return e;
        }
        failed.failure_reason = Some(reason.to_string());

        match self.save(&mut failed, intent.version).await {
            Ok(true) => {}
            Ok(false) => {
                if let Ok(current) = self.load(intent.id).await {
                    if matches!(current.status, IntentStatus::Expired | IntentStatus::Cancelled) {
                        return self.late_payment(&current, payment).await;
                    }
                }
                warn!(intent_id = %intent.id, "Intent changed while escalating payment");
            }
            Err(e) => error!(intent_id = %intent.id, error = %e, "Could not record escalation"),
        }

        self.record(
            self.audit_for(&intent, PaymentAuditEvent::ReconciliationMismatch)
                .reference(Some(&payment.reference))
                .gateway_uid(payment.gateway_uid.as_deref())
                .status(PaymentStatus::Succeeded)
                .received(payment.amount)
                .error(reason)
                .build(now),
        )
        .await;

        error!(
            intent_id = %intent.id,
            reason = reason,
            expected = intent.pricing.total,
            received = ?payment.amount,
            "Captured payment needs reconciliation"
        );
        BookingError::Reconciliation {
            intent_id: intent.id,
            reason: reason.to_string(),
        }
    }

    /// Payment for an intent that already expired or was cancelled. The
    /// intent stays as it is; the audit row drives the out-of-band refund.
    async fn late_payment(&self, intent: &BookingIntent, payment: &VerifiedPayment) -> BookingError {
        let reason = format!("payment received for {} intent", intent.status);
        self.record(
            self.audit_for(intent, PaymentAuditEvent::ReconciliationMismatch)
                .reference(Some(&payment.reference))
                .gateway_uid(payment.gateway_uid.as_deref())
                .status(PaymentStatus::Succeeded)
                .received(payment.amount)
                .error(reason.clone())
                .build(self.clock.now()),
        )
        .await;

        error!(
            intent_id = %intent.id,
            status = %intent.status,
            reference = %payment.reference,
            received = ?payment.amount,
            "Late payment on closed intent"
        );
        BookingError::Reconciliation {
            intent_id: intent.id,
            reason,
        }
    }

    // ------------------------------------------------------------------
    // CancelIntent
    // ------------------------------------------------------------------

    pub async fn cancel_intent(
        &self,
        user_id: Uuid,
        intent_id: Uuid,
        reason: Option<String>,
    ) -> Result<BookingIntent, BookingError> {
        let intent = self.owned(user_id, intent_id).await?;
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "cancelled_by_user".to_string());
        self.cancel(intent, reason).await
    }

    async fn cancel(&self, intent: BookingIntent, reason: String) -> Result<BookingIntent, BookingError> {
        if matches!(intent.status, IntentStatus::Expired | IntentStatus::Cancelled) {
            return Ok(intent);
        }
        if !intent.status.is_open() {
            return Err(conflict(&intent, "intent can no longer be cancelled"));
        }
        if intent.payment.last_status == Some(PaymentStatus::Succeeded) {
            return Err(conflict(&intent, "payment already captured"));
        }

        let now = self.clock.now();
        let mut next = intent.clone();
        advance(&mut next, IntentStatus::Cancelled, now)?;
        next.cancellation_reason = Some(reason.clone());

        if !self.save(&mut next, intent.version).await? {
            let current = self.load(intent.id).await?;
            if matches!(current.status, IntentStatus::Expired | IntentStatus::Cancelled) {
                return Ok(current);
            }
            return Err(conflict(&current, "intent changed concurrently"));
        }

        info!(intent_id = %next.id, reason = %reason, "Intent cancelled");
        Ok(self.release(next).await)
    }

    // ------------------------------------------------------------------
    // AddLoungeToIntent
    // ------------------------------------------------------------------

    /// Adds a lounge leg to a held intent. The new slot is held before the
    /// intent is rewritten and released again if the rewrite loses a race.
    pub async fn add_lounge_to_intent(
        &self,
        user_id: Uuid,
        intent_id: Uuid,
        leg: LoungeLeg,
        selection: LoungeSelection,
    ) -> Result<BookingIntent, BookingError> {
        let intent = self.owned(user_id, intent_id).await?;
        let now = self.clock.now();
        if intent.status != IntentStatus::Held || intent.is_expired(now) {
            return Err(conflict(&intent, "lounges can only be added to a held intent before payment"));
        }

        validation::validate_lounge(leg, &selection)?;
        let payload = intent
            .payload
            .with_lounge_leg(leg, selection.clone())
            .map_err(BookingError::Validation)?;
        if let Some(lounges) = payload.lounges() {
            validation::validate_distinct_slots(lounges)?;
        }

        let lounge = self.lounge_for(selection.lounge_id).await?;
        if lounge.currency != intent.pricing.currency {
            return Err(BookingError::Validation(format!(
                "lounge is priced in {}, intent in {}",
                lounge.currency, intent.pricing.currency
            )));
        }
        let fare = self.pricing.lounge_fare(&selection, &lounge)?;
        let pricing = intent.pricing.with_lounge_fare(leg, fare);

        let group = HoldGroup {
            leg: leg.into(),
            units: reservation::lounge_units(&selection),
        };
        if let Err(denials) =
            reservation::hold_group(self.ledger.as_ref(), &group, intent.id, intent.expires_at).await?
        {
            let report = AvailabilityReport {
                unavailable: vec![self.describe(&group, &denials).await],
            };
            return Err(BookingError::PartialAvailability(report));
        }

        let mut next = intent.clone();
        next.intent_type = payload.intent_type();
        next.payload = payload;
        next.pricing = pricing;
        next.updated_at = now;

        let saved = self.save(&mut next, intent.version).await;
        if !matches!(saved, Ok(true)) {
            if let Err(e) = self.ledger.release(&group.units, intent.id).await {
                error!(intent_id = %intent.id, error = %e, "Failed to release lounge hold after lost update");
            }
        }
        match saved {
            Ok(true) => {
                info!(intent_id = %next.id, leg = ?leg, total = next.pricing.total, "Lounge added to intent");
                Ok(next)
            }
            Ok(false) => {
                let current = self.load(intent.id).await?;
                Err(conflict(&current, "intent changed while adding lounge"))
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------

    /// Refunds a captured payment whose confirmation failed. A refund that
    /// was claimed but never reached the gateway may be retried.
    pub async fn initiate_refund(&self, intent_id: Uuid) -> Result<BookingIntent, BookingError> {
        let intent = self.load(intent_id).await?;
        let resuming = intent.status == IntentStatus::RefundInitiated && intent.payment.refund_id.is_none();
        if intent.status != IntentStatus::ConfirmationFailed && !resuming {
            return Err(conflict(&intent, "only failed confirmations can be refunded"));
        }
        let Some(gateway_uid) = intent.payment.gateway_uid.clone() else {
            return Err(conflict(&intent, "no captured payment to refund"));
        };

        let now = self.clock.now();
        let amount = intent.payment.paid_amount.unwrap_or(intent.pricing.total);
        let currency = intent.pricing.currency.clone();

        let mut claimed = intent.clone();
        if !resuming {
            advance(&mut claimed, IntentStatus::RefundInitiated, now)?;
            if !self.save(&mut claimed, intent.version).await? {
                let current = self.load(intent.id).await?;
                return Err(conflict(&current, "refund already in progress"));
            }
        }

        self.record(
            self.audit_for(&claimed, PaymentAuditEvent::RefundInitiated)
                .reference(claimed.payment.gateway_reference.as_deref())
                .gateway_uid(Some(&gateway_uid))
                .request(json!({ "amount": amount, "currency": currency }))
                .build(now),
        )
        .await;

        let receipt = match self.gateway.refund(&gateway_uid, amount, &currency).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(intent_id = %claimed.id, error = %e, "Refund request failed");
                self.record(
                    self.audit_for(&claimed, PaymentAuditEvent::Failure)
                        .gateway_uid(Some(&gateway_uid))
                        .error(format!("refund failed: {}", e))
                        .build(self.clock.now()),
                )
                .await;
                return Err(e.into());
            }
        };

        let mut next = claimed.clone();
        next.payment.refund_id = Some(receipt.refund_id.clone());
        next.updated_at = now;
        if receipt.settled {
            advance(&mut next, IntentStatus::Refunded, now)?;
            next.payment.last_status = Some(PaymentStatus::Refunded);
        }
        if !self.save(&mut next, claimed.version).await? {
            error!(intent_id = %claimed.id, refund_id = %receipt.refund_id, "Intent changed while recording refund");
            let current = self.load(claimed.id).await?;
            return Err(conflict(&current, "intent changed while recording refund"));
        }

        let event = if receipt.settled {
            PaymentAuditEvent::RefundCompleted
        } else {
            PaymentAuditEvent::GatewayResponse
        };
        self.record(
            self.audit_for(&next, event)
                .gateway_uid(Some(&gateway_uid))
                .response(receipt.raw.clone())
                .build(now),
        )
        .await;

        info!(intent_id = %next.id, refund_id = %receipt.refund_id, settled = receipt.settled, "Refund issued");
        Ok(self.release(next).await)
    }

    /// Marks a pending refund as settled by the gateway.
    pub async fn complete_refund(&self, intent_id: Uuid) -> Result<BookingIntent, BookingError> {
        let intent = self.load(intent_id).await?;
        if intent.status == IntentStatus::Refunded {
            return Ok(intent);
        }
        if intent.status != IntentStatus::RefundInitiated || intent.payment.refund_id.is_none() {
            return Err(conflict(&intent, "no refund awaiting settlement"));
        }

        let now = self.clock.now();
        let mut next = intent.clone();
        advance(&mut next, IntentStatus::Refunded, now)?;
        next.payment.last_status = Some(PaymentStatus::Refunded);
        if !self.save(&mut next, intent.version).await? {
            let current = self.load(intent.id).await?;
            return Err(conflict(&current, "intent changed while completing refund"));
        }

        self.record(
            self.audit_for(&next, PaymentAuditEvent::RefundCompleted)
                .gateway_uid(next.payment.gateway_uid.as_deref())
                .status(PaymentStatus::Refunded)
                .build(now),
        )
        .await;

        info!(intent_id = %next.id, "Refund settled");
        if next.capacity_released {
            return Ok(next);
        }
        Ok(self.release(next).await)
    }
}
