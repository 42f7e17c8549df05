use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transit_core::inventory::{InventoryProvider, LoungeListing, LoungeProduct, LoungeRate, SeatListing, TripListing};
use transit_core::{StoreError, StoreResult};
use uuid::Uuid;

use crate::database::store_err;

/// Reads the trip and lounge catalogue maintained by the CRUD services.
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryProvider for PgInventory {
    async fn trip(&self, trip_id: Uuid) -> StoreResult<Option<TripListing>> {
        let trip: Option<(DateTime<Utc>, String)> =
            sqlx::query_as("SELECT departure_at, currency FROM trips WHERE id = $1")
                .bind(trip_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;

        let Some((departure_at, currency)) = trip else {
            return Ok(None);
        };

        let stops: Vec<(Uuid,)> = sqlx::query_as("SELECT stop_id FROM trip_stops WHERE trip_id = $1 ORDER BY stop_order")
            .bind(trip_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let seats: Vec<(String, f64)> = sqlx::query_as("SELECT seat_id, fare FROM trip_seats WHERE trip_id = $1 ORDER BY seat_id")
            .bind(trip_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(Some(TripListing {
            trip_id,
            departure_at,
            stops: stops.into_iter().map(|(id,)| id).collect(),
            seats: seats
                .into_iter()
                .map(|(seat_id, fare)| SeatListing { seat_id, fare })
                .collect(),
            currency,
        }))
    }

    async fn lounge(&self, lounge_id: Uuid) -> StoreResult<Option<LoungeListing>> {
        let lounge: Option<(String, i32, String)> =
            sqlx::query_as("SELECT name, capacity, currency FROM lounges WHERE id = $1")
                .bind(lounge_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;

        let Some((name, capacity, currency)) = lounge else {
            return Ok(None);
        };

        let rates: Vec<(String, f64)> =
            sqlx::query_as("SELECT pricing_type, price_per_guest FROM lounge_rates WHERE lounge_id = $1")
                .bind(lounge_id)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;

        let products: Vec<(Uuid, String, f64)> =
            sqlx::query_as("SELECT id, name, price FROM lounge_products WHERE lounge_id = $1 ORDER BY name")
                .bind(lounge_id)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;

        let rates = rates
            .into_iter()
            .map(|(pricing_type, price_per_guest)| {
                Ok(LoungeRate {
                    pricing_type: pricing_type.parse().map_err(StoreError::Corrupt)?,
                    price_per_guest,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Some(LoungeListing {
            lounge_id,
            name,
            capacity: capacity.max(0) as u32,
            rates,
            products: products
                .into_iter()
                .map(|(product_id, name, price)| LoungeProduct { product_id, name, price })
                .collect(),
            currency,
        }))
    }
}
