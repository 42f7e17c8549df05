//! In-process implementations of the storage traits, used by tests and local
//! runs without Postgres. Locks are never held across an `.await`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use transit_core::audit::{PaymentAudit, PaymentAuditLog};
use transit_core::intent::{BookingIntent, BookingResult, IntentStatus, LoungeLeg};
use transit_core::repository::{BookingWriter, InsertOutcome, IntentRepository, KeyClaim, PaymentReference};
use transit_core::{StoreError, StoreResult};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
}

// ============================================================================
// Intents
// ============================================================================

#[derive(Default)]
struct IntentTables {
    intents: HashMap<Uuid, BookingIntent>,
    references: HashMap<String, PaymentReference>,
    claims: HashMap<(Uuid, String), (Uuid, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryIntentRepository {
    tables: Mutex<IntentTables>,
}

impl MemoryIntentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        lock(&self.tables).map(|t| t.intents.len()).unwrap_or(0)
    }
}

fn open_with_key<'a>(tables: &'a IntentTables, user_id: Uuid, key: &str) -> Option<&'a BookingIntent> {
    tables
        .intents
        .values()
        .filter(|i| i.user_id == user_id && i.idempotency_key.as_deref() == Some(key))
        .filter(|i| !i.status.is_terminal())
        .max_by_key(|i| i.created_at)
}

#[async_trait]
impl IntentRepository for MemoryIntentRepository {
    async fn insert(&self, intent: &BookingIntent) -> StoreResult<InsertOutcome> {
        let mut tables = lock(&self.tables)?;

        if let Some(key) = &intent.idempotency_key {
            if let Some(existing) = open_with_key(&tables, intent.user_id, key) {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
        }
        if tables.intents.contains_key(&intent.id) {
            return Err(StoreError::Conflict(format!("intent {} already exists", intent.id)));
        }

        tables.intents.insert(intent.id, intent.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<BookingIntent>> {
        Ok(lock(&self.tables)?.intents.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<BookingIntent>> {
        let tables = lock(&self.tables)?;
        Ok(open_with_key(&tables, user_id, key).cloned())
    }

    async fn claim_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
        intent_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<KeyClaim> {
        let mut tables = lock(&self.tables)?;
        let slot = (user_id, key.to_string());

        if let Some((owner, claimed_at)) = tables.claims.get(&slot).copied() {
            let live = match tables.intents.get(&owner) {
                Some(intent) => !intent.status.is_terminal(),
                None => claimed_at >= stale_before,
            };
            if owner != intent_id && live {
                return Ok(KeyClaim::InFlight);
            }
        }

        tables.claims.insert(slot, (intent_id, now));
        Ok(KeyClaim::Claimed)
    }

    async fn release_idempotency_key(&self, user_id: Uuid, key: &str, intent_id: Uuid) -> StoreResult<()> {
        let mut tables = lock(&self.tables)?;
        let slot = (user_id, key.to_string());
        if tables.claims.get(&slot).is_some_and(|(owner, _)| *owner == intent_id) {
            tables.claims.remove(&slot);
        }
        Ok(())
    }

    async fn replace(&self, intent: &BookingIntent, expected_version: i64) -> StoreResult<bool> {
        let mut tables = lock(&self.tables)?;
        let Some(stored) = tables.intents.get_mut(&intent.id) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }

        let mut next = intent.clone();
        next.version = expected_version + 1;
        *stored = next;
        Ok(true)
    }

    async fn record_payment_reference(&self, reference: &PaymentReference) -> StoreResult<()> {
        let mut tables = lock(&self.tables)?;
        if tables.references.contains_key(&reference.reference) {
            return Err(StoreError::Conflict(format!(
                "payment reference {} already recorded",
                reference.reference
            )));
        }
        tables
            .references
            .insert(reference.reference.clone(), reference.clone());
        Ok(())
    }

    async fn find_payment_reference(&self, reference: &str) -> StoreResult<Option<PaymentReference>> {
        Ok(lock(&self.tables)?.references.get(reference).cloned())
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        let tables = lock(&self.tables)?;
        let mut expired: Vec<BookingIntent> = tables
            .intents
            .values()
            .filter(|i| i.status.is_open() && i.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|i| i.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn list_unreleased(&self, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        let tables = lock(&self.tables)?;
        let mut pending: Vec<BookingIntent> = tables
            .intents
            .values()
            .filter(|i| {
                !i.capacity_released
                    && matches!(
                        i.status,
                        IntentStatus::Expired | IntentStatus::Cancelled | IntentStatus::Refunded
                    )
            })
            .cloned()
            .collect();
        pending.sort_by_key(|i| i.updated_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_stalled_confirmations(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        let tables = lock(&self.tables)?;
        let mut stalled: Vec<BookingIntent> = tables
            .intents
            .values()
            .filter(|i| i.status == IntentStatus::Confirming && i.updated_at <= before)
            .cloned()
            .collect();
        stalled.sort_by_key(|i| i.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Default)]
pub struct MemoryPaymentAuditLog {
    rows: Mutex<Vec<PaymentAudit>>,
}

impl MemoryPaymentAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<PaymentAudit> {
        lock(&self.rows).map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PaymentAuditLog for MemoryPaymentAuditLog {
    async fn append(&self, audit: &PaymentAudit) -> StoreResult<()> {
        lock(&self.rows)?.push(audit.clone());
        Ok(())
    }

    async fn list_for_intent(&self, intent_id: Uuid) -> StoreResult<Vec<PaymentAudit>> {
        Ok(lock(&self.rows)?
            .iter()
            .filter(|a| a.intent_id == intent_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Bookings
// ============================================================================

#[derive(Default)]
pub struct MemoryBookingWriter {
    bookings: Mutex<HashMap<Uuid, BookingResult>>,
    fail: AtomicBool,
}

impl MemoryBookingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn booking_for(&self, intent_id: Uuid) -> Option<BookingResult> {
        lock(&self.bookings).ok()?.get(&intent_id).cloned()
    }

    pub fn count(&self) -> usize {
        lock(&self.bookings).map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BookingWriter for MemoryBookingWriter {
    async fn create_bookings(&self, intent: &BookingIntent) -> StoreResult<BookingResult> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("booking store unavailable".into()));
        }

        let mut bookings = lock(&self.bookings)?;
        let result = bookings.entry(intent.id).or_insert_with(|| {
            let mut result = BookingResult::default();
            if intent.payload.bus().is_some() {
                result.bus_booking_id = Some(Uuid::new_v4());
            }
            for (leg, _) in intent.payload.lounge_legs() {
                match leg {
                    LoungeLeg::PreTrip => result.pre_trip_lounge_booking_id = Some(Uuid::new_v4()),
                    LoungeLeg::PostTrip => result.post_trip_lounge_booking_id = Some(Uuid::new_v4()),
                }
            }
            result
        });
        Ok(result.clone())
    }
}
