use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use transit_core::intent::{BookingIntent, BookingResult, LoungeLeg};
use transit_core::repository::BookingWriter;
use transit_core::StoreResult;
use uuid::Uuid;

use crate::database::store_err;

/// Writes permanent bookings from the frozen intent payload. Rows are unique
/// per intent (and per lounge leg), so replaying a confirmation returns the
/// ids written the first time.
pub struct PgBookingWriter {
    pool: PgPool,
}

impl PgBookingWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn leg_name(leg: LoungeLeg) -> &'static str {
    match leg {
        LoungeLeg::PreTrip => "pre_trip",
        LoungeLeg::PostTrip => "post_trip",
    }
}

#[async_trait]
impl BookingWriter for PgBookingWriter {
    async fn create_bookings(&self, intent: &BookingIntent) -> StoreResult<BookingResult> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut result = BookingResult::default();
        let reference = intent.payment.gateway_reference.as_deref();

        if let Some(bus) = intent.payload.bus() {
            sqlx::query(
                r#"
                INSERT INTO bus_bookings (
                    id, intent_id, user_id, trip_id, boarding_stop_id, alighting_stop_id,
                    seats, fare, currency, payment_reference
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (intent_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(intent.id)
            .bind(intent.user_id)
            .bind(bus.trip_id)
            .bind(bus.boarding_stop_id)
            .bind(bus.alighting_stop_id)
            .bind(Json(&bus.seats))
            .bind(intent.pricing.bus_fare)
            .bind(&intent.pricing.currency)
            .bind(reference)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

            let (id,): (Uuid,) = sqlx::query_as("SELECT id FROM bus_bookings WHERE intent_id = $1")
                .bind(intent.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?;
            result.bus_booking_id = Some(id);
        }

        for (leg, lounge) in intent.payload.lounge_legs() {
            let fare = intent.pricing.lounge_fare(leg).map(|f| f.total).unwrap_or(0.0);

            sqlx::query(
                r#"
                INSERT INTO lounge_bookings (
                    id, intent_id, leg, user_id, lounge_id, slot_date, slot_start, slot_end,
                    pricing_type, guests, pre_orders, fare, currency, payment_reference
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (intent_id, leg) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(intent.id)
            .bind(leg_name(leg))
            .bind(intent.user_id)
            .bind(lounge.lounge_id)
            .bind(lounge.date)
            .bind(lounge.slot_start)
            .bind(lounge.slot_end)
            .bind(lounge.pricing_type.as_str())
            .bind(Json(&lounge.guests))
            .bind(Json(&lounge.pre_orders))
            .bind(fare)
            .bind(&intent.pricing.currency)
            .bind(reference)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

            let (id,): (Uuid,) = sqlx::query_as("SELECT id FROM lounge_bookings WHERE intent_id = $1 AND leg = $2")
                .bind(intent.id)
                .bind(leg_name(leg))
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?;

            match leg {
                LoungeLeg::PreTrip => result.pre_trip_lounge_booking_id = Some(id),
                LoungeLeg::PostTrip => result.post_trip_lounge_booking_id = Some(id),
            }
        }

        tx.commit().await.map_err(store_err)?;
        Ok(result)
    }
}
