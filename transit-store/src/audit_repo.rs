use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transit_core::audit::{PaymentAudit, PaymentAuditLog};
use transit_core::{StoreError, StoreResult};
use uuid::Uuid;

use crate::database::store_err;

pub struct PgPaymentAuditLog {
    pool: PgPool,
}

impl PgPaymentAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    intent_id: Uuid,
    user_id: Uuid,
    event: String,
    gateway: Option<String>,
    gateway_reference: Option<String>,
    gateway_uid: Option<String>,
    payment_status: Option<String>,
    expected_amount: Option<f64>,
    received_amount: Option<f64>,
    amounts_match: Option<bool>,
    currency: Option<String>,
    request_payload: Option<serde_json::Value>,
    response_payload: Option<serde_json::Value>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for PaymentAudit {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(PaymentAudit {
            id: row.id,
            intent_id: row.intent_id,
            user_id: row.user_id,
            event: row.event.parse().map_err(StoreError::Corrupt)?,
            gateway: row.gateway,
            gateway_reference: row.gateway_reference,
            gateway_uid: row.gateway_uid,
            payment_status: row
                .payment_status
                .map(|s| s.parse())
                .transpose()
                .map_err(StoreError::Corrupt)?,
            expected_amount: row.expected_amount,
            received_amount: row.received_amount,
            amounts_match: row.amounts_match,
            currency: row.currency,
            request_payload: row.request_payload,
            response_payload: row.response_payload,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl PaymentAuditLog for PgPaymentAuditLog {
    async fn append(&self, audit: &PaymentAudit) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_audit (
                id, intent_id, user_id, event, gateway, gateway_reference, gateway_uid,
                payment_status, expected_amount, received_amount, amounts_match, currency,
                request_payload, response_payload, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(audit.id)
        .bind(audit.intent_id)
        .bind(audit.user_id)
        .bind(audit.event.as_str())
        .bind(&audit.gateway)
        .bind(&audit.gateway_reference)
        .bind(&audit.gateway_uid)
        .bind(audit.payment_status.map(|s| s.as_str()))
        .bind(audit.expected_amount)
        .bind(audit.received_amount)
        .bind(audit.amounts_match)
        .bind(&audit.currency)
        .bind(&audit.request_payload)
        .bind(&audit.response_payload)
        .bind(&audit.error_message)
        .bind(audit.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_for_intent(&self, intent_id: Uuid) -> StoreResult<Vec<PaymentAudit>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, intent_id, user_id, event, gateway, gateway_reference, gateway_uid,
                   payment_status, expected_amount, received_amount, amounts_match, currency,
                   request_payload, response_payload, error_message, created_at
            FROM payment_audit
            WHERE intent_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter().map(PaymentAudit::try_from).collect()
    }
}
