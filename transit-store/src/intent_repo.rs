use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use transit_core::intent::{BookingIntent, BookingResult, IntentPayload, PaymentTracking, PriceSnapshot};
use transit_core::repository::{InsertOutcome, IntentRepository, KeyClaim, PaymentReference};
use transit_core::{StoreError, StoreResult};
use uuid::Uuid;

use crate::database::{is_unique_violation, store_err};

const INTENT_COLUMNS: &str = r#"
    id, user_id, idempotency_key, intent_type, status, payload, pricing, payment, result,
    expires_at, ttl_extended, capacity_released, cancellation_reason, failure_reason,
    version, created_at, updated_at, confirmed_at
"#;

pub struct PgIntentRepository {
    pool: PgPool,
}

impl PgIntentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    user_id: Uuid,
    idempotency_key: Option<String>,
    intent_type: String,
    status: String,
    payload: Json<IntentPayload>,
    pricing: Json<PriceSnapshot>,
    payment: Json<PaymentTracking>,
    result: Option<Json<BookingResult>>,
    expires_at: DateTime<Utc>,
    ttl_extended: bool,
    capacity_released: bool,
    cancellation_reason: Option<String>,
    failure_reason: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
}

impl TryFrom<IntentRow> for BookingIntent {
    type Error = StoreError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(BookingIntent {
            id: row.id,
            user_id: row.user_id,
            idempotency_key: row.idempotency_key,
            intent_type: row.intent_type.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            payload: row.payload.0,
            pricing: row.pricing.0,
            payment: row.payment.0,
            result: row.result.map(|r| r.0),
            expires_at: row.expires_at,
            ttl_extended: row.ttl_extended,
            capacity_released: row.capacity_released,
            cancellation_reason: row.cancellation_reason,
            failure_reason: row.failure_reason,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            confirmed_at: row.confirmed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentReferenceRow {
    reference: String,
    intent_id: Uuid,
    gateway_uid: String,
    status_token: String,
    created_at: DateTime<Utc>,
}

fn into_intents(rows: Vec<IntentRow>) -> StoreResult<Vec<BookingIntent>> {
    rows.into_iter().map(BookingIntent::try_from).collect()
}

#[async_trait]
impl IntentRepository for PgIntentRepository {
    async fn insert(&self, intent: &BookingIntent) -> StoreResult<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO booking_intents (
                id, user_id, idempotency_key, intent_type, status, payload, pricing, payment, result,
                total_amount, currency, expires_at, ttl_extended, capacity_released,
                cancellation_reason, failure_reason, version, created_at, updated_at, confirmed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(intent.id)
        .bind(intent.user_id)
        .bind(&intent.idempotency_key)
        .bind(intent.intent_type.as_str())
        .bind(intent.status.as_str())
        .bind(Json(&intent.payload))
        .bind(Json(&intent.pricing))
        .bind(Json(&intent.payment))
        .bind(intent.result.as_ref().map(Json))
        .bind(intent.pricing.total)
        .bind(&intent.pricing.currency)
        .bind(intent.expires_at)
        .bind(intent.ttl_extended)
        .bind(intent.capacity_released)
        .bind(&intent.cancellation_reason)
        .bind(&intent.failure_reason)
        .bind(intent.version)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .bind(intent.confirmed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => {
                if let Some(key) = &intent.idempotency_key {
                    if let Some(existing) = self.find_by_idempotency_key(intent.user_id, key).await? {
                        return Ok(InsertOutcome::Duplicate(existing));
                    }
                }
                Err(store_err(e))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<BookingIntent>> {
        let sql = format!("SELECT {} FROM booking_intents WHERE id = $1", INTENT_COLUMNS);
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(BookingIntent::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, user_id: Uuid, key: &str) -> StoreResult<Option<BookingIntent>> {
        let sql = format!(
            r#"
            SELECT {} FROM booking_intents
            WHERE user_id = $1 AND idempotency_key = $2
              AND status NOT IN ('confirmed', 'expired', 'cancelled', 'refunded')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INTENT_COLUMNS
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(user_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(BookingIntent::try_from).transpose()
    }

    async fn claim_idempotency_key(
        &self,
        user_id: Uuid,
        key: &str,
        intent_id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<KeyClaim> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO idempotency_claims (user_id, idempotency_key, intent_id, claimed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, idempotency_key) DO UPDATE
            SET intent_id = EXCLUDED.intent_id, claimed_at = EXCLUDED.claimed_at
            WHERE idempotency_claims.intent_id = EXCLUDED.intent_id
               OR EXISTS (
                    SELECT 1 FROM booking_intents i
                    WHERE i.id = idempotency_claims.intent_id
                      AND i.status IN ('confirmed', 'expired', 'cancelled', 'refunded')
               )
               OR (
                    idempotency_claims.claimed_at < $5
                    AND NOT EXISTS (SELECT 1 FROM booking_intents i WHERE i.id = idempotency_claims.intent_id)
               )
            RETURNING intent_id
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(intent_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(match claimed {
            Some(_) => KeyClaim::Claimed,
            None => KeyClaim::InFlight,
        })
    }

    async fn release_idempotency_key(&self, user_id: Uuid, key: &str, intent_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM idempotency_claims WHERE user_id = $1 AND idempotency_key = $2 AND intent_id = $3")
            .bind(user_id)
            .bind(key)
            .bind(intent_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn replace(&self, intent: &BookingIntent, expected_version: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE booking_intents SET
                intent_type = $3,
                status = $4,
                payload = $5,
                pricing = $6,
                payment = $7,
                result = $8,
                total_amount = $9,
                currency = $10,
                expires_at = $11,
                ttl_extended = $12,
                capacity_released = $13,
                cancellation_reason = $14,
                failure_reason = $15,
                updated_at = $16,
                confirmed_at = $17,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(intent.id)
        .bind(expected_version)
        .bind(intent.intent_type.as_str())
        .bind(intent.status.as_str())
        .bind(Json(&intent.payload))
        .bind(Json(&intent.pricing))
        .bind(Json(&intent.payment))
        .bind(intent.result.as_ref().map(Json))
        .bind(intent.pricing.total)
        .bind(&intent.pricing.currency)
        .bind(intent.expires_at)
        .bind(intent.ttl_extended)
        .bind(intent.capacity_released)
        .bind(&intent.cancellation_reason)
        .bind(&intent.failure_reason)
        .bind(intent.updated_at)
        .bind(intent.confirmed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_payment_reference(&self, reference: &PaymentReference) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_references (reference, intent_id, gateway_uid, status_token, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&reference.reference)
        .bind(reference.intent_id)
        .bind(&reference.gateway_uid)
        .bind(&reference.status_token)
        .bind(reference.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_payment_reference(&self, reference: &str) -> StoreResult<Option<PaymentReference>> {
        let row = sqlx::query_as::<_, PaymentReferenceRow>(
            r#"
            SELECT reference, intent_id, gateway_uid, status_token, created_at
            FROM payment_references
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|r| PaymentReference {
            reference: r.reference,
            intent_id: r.intent_id,
            gateway_uid: r.gateway_uid,
            status_token: r.status_token,
            created_at: r.created_at,
        }))
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        let sql = format!(
            r#"
            SELECT {} FROM booking_intents
            WHERE status IN ('held', 'payment_pending') AND expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        into_intents(rows)
    }

    async fn list_unreleased(&self, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        let sql = format!(
            r#"
            SELECT {} FROM booking_intents
            WHERE capacity_released = FALSE AND status IN ('expired', 'cancelled', 'refunded')
            ORDER BY updated_at
            LIMIT $1
            "#,
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        into_intents(rows)
    }

    async fn list_stalled_confirmations(&self, before: DateTime<Utc>, limit: usize) -> StoreResult<Vec<BookingIntent>> {
        let sql = format!(
            r#"
            SELECT {} FROM booking_intents
            WHERE status = 'confirming' AND updated_at <= $1
            ORDER BY updated_at
            LIMIT $2
            "#,
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        into_intents(rows)
    }
}
