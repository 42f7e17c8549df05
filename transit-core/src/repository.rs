use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::{BookingIntent, BookingResult};
use crate::StoreResult;

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted,
    /// Another open intent of the same user already owns the idempotency key.
    Duplicate(BookingIntent),
}

/// Result of reserving an idempotency key before capacity is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClaim {
    Claimed,
    /// Another request owns the key and has not written or abandoned its intent yet.
    InFlight,
}

/// Every gateway reference issued for an intent. References are unique
/// across the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentReference {
    pub reference: String,
    pub intent_id: Uuid,
    pub gateway_uid: String,
    pub status_token: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait IntentRepository: Send + Sync {
    /// Persist a new intent. The idempotency key is unique per user among
    /// non-terminal intents; a clash returns the existing intent.
    async fn insert(&self, intent: &BookingIntent) -> StoreResult<InsertOutcome>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<BookingIntent>>;

    async fn find_by_idempotency_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<BookingIntent>>;

    /// Reserves `key` for `intent_id`. An existing claim is taken over once
    /// its intent is terminal, or when no intent was written for it and it
    /// was claimed before `stale_before`.
    async fn claim_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
        intent_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<KeyClaim>;

    /// Drops the claim on `key` if `intent_id` still owns it.
    async fn release_idempotency_key(&self, user_id: Uuid, key: &str, intent_id: Uuid) -> StoreResult<()>;

    /// Compare-and-swap write: succeeds only if the stored version still
    /// equals `expected_version`. The stored version becomes `expected_version + 1`.
    async fn replace(&self, intent: &BookingIntent, expected_version: i64) -> StoreResult<bool>;

    async fn record_payment_reference(&self, reference: &PaymentReference) -> StoreResult<()>;

    async fn find_payment_reference(&self, reference: &str) -> StoreResult<Option<PaymentReference>>;

    /// Open intents whose TTL elapsed at `now`, oldest first.
    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>>;

    /// Expired, cancelled or refunded intents whose capacity release has not
    /// been recorded yet.
    async fn list_unreleased(&self, limit: usize) -> StoreResult<Vec<BookingIntent>>;

    /// Intents left in `confirming` with no update since `before`, oldest first.
    async fn list_stalled_confirmations(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>>;
}

/// Writes the permanent bus/lounge booking aggregates from a frozen intent.
/// Must be idempotent per intent so a retried confirmation never duplicates rows.
#[async_trait]
pub trait BookingWriter: Send + Sync {
    async fn create_bookings(&self, intent: &BookingIntent) -> StoreResult<BookingResult>;
}
