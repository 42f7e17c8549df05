use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transit_core::capacity::{CapacityLedger, CapacityRef, Denial, DenialReason, HoldOutcome, SlotKey};
use transit_core::{StoreError, StoreResult};
use uuid::Uuid;

use crate::database::store_err;

/// Postgres capacity ledger. Seat holds are single conditional UPDATEs; the
/// lounge counter is incremented only while it stays within capacity.
pub struct PgCapacityLedger {
    pool: PgPool,
}

impl PgCapacityLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn hold_seat(
        &self,
        trip_id: Uuid,
        seat_id: &str,
        intent_id: Uuid,
        held_until: DateTime<Utc>,
    ) -> StoreResult<Result<(), DenialReason>> {
        let result = sqlx::query(
            r#"
            UPDATE trip_seats
            SET status = 'held', held_by = $3, held_until = $4, updated_at = NOW()
            WHERE trip_id = $1 AND seat_id = $2
              AND (status = 'available' OR (status = 'held' AND held_by = $3))
            "#,
        )
        .bind(trip_id)
        .bind(seat_id)
        .bind(intent_id)
        .bind(held_until)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 1 {
            return Ok(Ok(()));
        }

        let exists: Option<(String,)> = sqlx::query_as("SELECT status FROM trip_seats WHERE trip_id = $1 AND seat_id = $2")
            .bind(trip_id)
            .bind(seat_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(Err(match exists {
            Some(_) => DenialReason::SeatTaken,
            None => DenialReason::UnknownResource,
        }))
    }

    async fn hold_slot(
        &self,
        slot: &SlotKey,
        guests: u32,
        intent_id: Uuid,
        held_until: DateTime<Utc>,
    ) -> StoreResult<Result<(), DenialReason>> {
        let guests = guests as i32;
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO lounge_slot_capacity (lounge_id, slot_date, slot_start, slot_end, capacity)
            SELECT id, $2, $3, $4, capacity FROM lounges WHERE id = $1
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(slot.lounge_id)
        .bind(slot.date)
        .bind(slot.slot_start)
        .bind(slot.slot_end)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let updated: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE lounge_slot_capacity
            SET held_guests = held_guests + $5
            WHERE lounge_id = $1 AND slot_date = $2 AND slot_start = $3 AND slot_end = $4
              AND held_guests + $5 <= capacity
            RETURNING held_guests
            "#,
        )
        .bind(slot.lounge_id)
        .bind(slot.date)
        .bind(slot.slot_start)
        .bind(slot.slot_end)
        .bind(guests)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        if updated.is_none() {
            let remaining: Option<(i32,)> = sqlx::query_as(
                r#"
                SELECT capacity - held_guests FROM lounge_slot_capacity
                WHERE lounge_id = $1 AND slot_date = $2 AND slot_start = $3 AND slot_end = $4
                "#,
            )
            .bind(slot.lounge_id)
            .bind(slot.date)
            .bind(slot.slot_start)
            .bind(slot.slot_end)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
            tx.rollback().await.map_err(store_err)?;

            return Ok(Err(match remaining {
                Some((available,)) => DenialReason::SlotFull {
                    requested: guests as u32,
                    available: available.max(0) as u32,
                },
                None => DenialReason::UnknownResource,
            }));
        }

        sqlx::query(
            r#"
            INSERT INTO lounge_capacity_holds
                (intent_id, lounge_id, slot_date, slot_start, slot_end, guests, status, held_until)
            VALUES ($1, $2, $3, $4, $5, $6, 'held', $7)
            ON CONFLICT (intent_id, lounge_id, slot_date, slot_start, slot_end) DO UPDATE SET
                guests = CASE WHEN lounge_capacity_holds.status = 'released'
                              THEN EXCLUDED.guests
                              ELSE lounge_capacity_holds.guests + EXCLUDED.guests END,
                status = 'held',
                held_until = EXCLUDED.held_until,
                updated_at = NOW()
            "#,
        )
        .bind(intent_id)
        .bind(slot.lounge_id)
        .bind(slot.date)
        .bind(slot.slot_start)
        .bind(slot.slot_end)
        .bind(guests)
        .bind(held_until)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(Ok(()))
    }
}

#[async_trait]
impl CapacityLedger for PgCapacityLedger {
    async fn try_hold(
        &self,
        units: &[CapacityRef],
        intent_id: Uuid,
        held_until: DateTime<Utc>,
    ) -> StoreResult<HoldOutcome> {
        let mut outcome = HoldOutcome::default();

        for unit in units {
            let result = match unit {
                CapacityRef::Seat { trip_id, seat_id } => {
                    self.hold_seat(*trip_id, seat_id, intent_id, held_until).await?
                }
                CapacityRef::LoungeSlot { slot, guests } => {
                    self.hold_slot(slot, *guests, intent_id, held_until).await?
                }
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
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for unit in units {
            match unit {
                CapacityRef::Seat { trip_id, seat_id } => {
                    sqlx::query(
                        r#"
                        UPDATE trip_seats SET held_until = $4, updated_at = NOW()
                        WHERE trip_id = $1 AND seat_id = $2 AND held_by = $3 AND status = 'held'
                        "#,
                    )
                    .bind(trip_id)
                    .bind(seat_id)
                    .bind(intent_id)
                    .bind(held_until)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                }
                CapacityRef::LoungeSlot { slot, .. } => {
                    sqlx::query(
                        r#"
                        UPDATE lounge_capacity_holds SET held_until = $6, updated_at = NOW()
                        WHERE intent_id = $1 AND lounge_id = $2 AND slot_date = $3
                          AND slot_start = $4 AND slot_end = $5 AND status = 'held'
                        "#,
                    )
                    .bind(intent_id)
                    .bind(slot.lounge_id)
                    .bind(slot.date)
                    .bind(slot.slot_start)
                    .bind(slot.slot_end)
                    .bind(held_until)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                }
            }
        }

        tx.commit().await.map_err(store_err)
    }

    async fn release(&self, units: &[CapacityRef], intent_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for unit in units {
            match unit {
                CapacityRef::Seat { trip_id, seat_id } => {
                    sqlx::query(
                        r#"
                        UPDATE trip_seats
                        SET status = 'available', held_by = NULL, held_until = NULL, updated_at = NOW()
                        WHERE trip_id = $1 AND seat_id = $2 AND held_by = $3
                          AND status IN ('held', 'booked')
                        "#,
                    )
                    .bind(trip_id)
                    .bind(seat_id)
                    .bind(intent_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                }
                CapacityRef::LoungeSlot { slot, .. } => {
                    let freed: Option<(i32,)> = sqlx::query_as(
                        r#"
                        UPDATE lounge_capacity_holds SET status = 'released', updated_at = NOW()
                        WHERE intent_id = $1 AND lounge_id = $2 AND slot_date = $3
                          AND slot_start = $4 AND slot_end = $5
                          AND status IN ('held', 'confirmed')
                        RETURNING guests
                        "#,
                    )
                    .bind(intent_id)
                    .bind(slot.lounge_id)
                    .bind(slot.date)
                    .bind(slot.slot_start)
                    .bind(slot.slot_end)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(store_err)?;

                    if let Some((guests,)) = freed {
                        sqlx::query(
                            r#"
                            UPDATE lounge_slot_capacity
                            SET held_guests = GREATEST(held_guests - $5, 0)
                            WHERE lounge_id = $1 AND slot_date = $2 AND slot_start = $3 AND slot_end = $4
                            "#,
                        )
                        .bind(slot.lounge_id)
                        .bind(slot.date)
                        .bind(slot.slot_start)
                        .bind(slot.slot_end)
                        .bind(guests)
                        .execute(&mut *tx)
                        .await
                        .map_err(store_err)?;
                    }
                }
            }
        }

        tx.commit().await.map_err(store_err)
    }

    async fn commit(&self, units: &[CapacityRef], intent_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for unit in units {
            let affected = match unit {
                CapacityRef::Seat { trip_id, seat_id } => sqlx::query(
                    r#"
                    UPDATE trip_seats SET status = 'booked', held_until = NULL, updated_at = NOW()
                    WHERE trip_id = $1 AND seat_id = $2 AND held_by = $3
                      AND status IN ('held', 'booked')
                    "#,
                )
                .bind(trip_id)
                .bind(seat_id)
                .bind(intent_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?
                .rows_affected(),
                CapacityRef::LoungeSlot { slot, .. } => sqlx::query(
                    r#"
                    UPDATE lounge_capacity_holds SET status = 'confirmed', updated_at = NOW()
                    WHERE intent_id = $1 AND lounge_id = $2 AND slot_date = $3
                      AND slot_start = $4 AND slot_end = $5
                      AND status IN ('held', 'confirmed')
                    "#,
                )
                .bind(intent_id)
                .bind(slot.lounge_id)
                .bind(slot.date)
                .bind(slot.slot_start)
                .bind(slot.slot_end)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?
                .rows_affected(),
            };

            if affected == 0 {
                // Dropping the transaction rolls back the units already committed.
                return Err(StoreError::Conflict(format!(
                    "capacity unit {:?} is not held by intent {}",
                    unit, intent_id
                )));
            }
        }

        tx.commit().await.map_err(store_err)
    }

    async fn available_seats(&self, trip_id: Uuid, limit: usize) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT seat_id FROM trip_seats
            WHERE trip_id = $1 AND status = 'available'
            ORDER BY seat_id
            LIMIT $2
            "#,
        )
        .bind(trip_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows.into_iter().map(|(seat,)| seat).collect())
    }
}
