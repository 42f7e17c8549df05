use async_trait::async_trait;
use dashmap::DashMap;
use transit_core::inventory::{InventoryProvider, LoungeListing, TripListing};
use transit_core::StoreResult;
use uuid::Uuid;

/// In-memory trip and lounge catalogue, seeded by the caller.
#[derive(Default)]
pub struct StaticInventory {
    trips: DashMap<Uuid, TripListing>,
    lounges: DashMap<Uuid, LoungeListing>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trip(&self, trip: TripListing) {
        self.trips.insert(trip.trip_id, trip);
    }

    pub fn add_lounge(&self, lounge: LoungeListing) {
        self.lounges.insert(lounge.lounge_id, lounge);
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn trip(&self, trip_id: Uuid) -> StoreResult<Option<TripListing>> {
        Ok(self.trips.get(&trip_id).map(|t| t.value().clone()))
    }

    async fn lounge(&self, lounge_id: Uuid) -> StoreResult<Option<LoungeListing>> {
        Ok(self.lounges.get(&lounge_id).map(|l| l.value().clone()))
    }
}
