use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::LoungePricingType;
use crate::StoreResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatListing {
    pub seat_id: String,
    pub fare: f64,
}

/// Scheduled trip as seen by the booking engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripListing {
    pub trip_id: Uuid,
    pub departure_at: DateTime<Utc>,
    /// Stop ids in travel order.
    pub stops: Vec<Uuid>,
    pub seats: Vec<SeatListing>,
    pub currency: String,
}

impl TripListing {
    pub fn seat(&self, seat_id: &str) -> Option<&SeatListing> {
        self.seats.iter().find(|s| s.seat_id == seat_id)
    }

    pub fn stop_position(&self, stop_id: Uuid) -> Option<usize> {
        self.stops.iter().position(|s| *s == stop_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoungeRate {
    pub pricing_type: LoungePricingType,
    pub price_per_guest: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoungeProduct {
    pub product_id: Uuid,
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoungeListing {
    pub lounge_id: Uuid,
    pub name: String,
    /// Maximum guests per time slot.
    pub capacity: u32,
    pub rates: Vec<LoungeRate>,
    pub products: Vec<LoungeProduct>,
    pub currency: String,
}

impl LoungeListing {
    pub fn rate(&self, pricing_type: LoungePricingType) -> Option<f64> {
        self.rates
            .iter()
            .find(|r| r.pricing_type == pricing_type)
            .map(|r| r.price_per_guest)
    }

    pub fn product(&self, product_id: Uuid) -> Option<&LoungeProduct> {
        self.products.iter().find(|p| p.product_id == product_id)
    }
}

/// Read side of the trip/lounge catalogue owned by the CRUD services.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn trip(&self, trip_id: Uuid) -> StoreResult<Option<TripListing>>;
    async fn lounge(&self, lounge_id: Uuid) -> StoreResult<Option<LoungeListing>>;
}
