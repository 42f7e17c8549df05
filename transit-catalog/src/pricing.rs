use serde::{Deserialize, Serialize};
use transit_core::intent::{BusSelection, LoungeFare, LoungeLeg, LoungeSelection, PriceSnapshot, SeatFare};
use transit_core::inventory::{LoungeListing, TripListing};
use transit_core::round_money;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Currency used when no trip or lounge dictates one.
    pub default_currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_currency: "LKR".to_string(),
        }
    }
}

/// Computes fares from live catalogue prices. Client-supplied prices are never read.
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    /// Per-seat fares and their sum.
    pub fn bus_fare(&self, selection: &BusSelection, trip: &TripListing) -> Result<(Vec<SeatFare>, f64), PricingError> {
        let mut fares = Vec::with_capacity(selection.seats.len());
        for seat in &selection.seats {
            let listing = trip
                .seat(&seat.seat_id)
                .ok_or_else(|| PricingError::UnknownSeat(seat.seat_id.clone()))?;
            fares.push(SeatFare {
                seat_id: seat.seat_id.clone(),
                fare: round_money(listing.fare),
            });
        }
        let total = round_money(fares.iter().map(|f| f.fare).sum());
        Ok((fares, total))
    }

    /// Rate per guest times guests, plus pre-ordered products.
    pub fn lounge_fare(&self, selection: &LoungeSelection, lounge: &LoungeListing) -> Result<LoungeFare, PricingError> {
        let rate = lounge
            .rate(selection.pricing_type)
            .ok_or_else(|| PricingError::UnknownRate {
                lounge_id: lounge.lounge_id,
                pricing_type: selection.pricing_type.as_str().to_string(),
            })?;

        let mut pre_orders = 0.0;
        for line in &selection.pre_orders {
            let product = lounge
                .product(line.product_id)
                .ok_or(PricingError::UnknownProduct {
                    lounge_id: lounge.lounge_id,
                    product_id: line.product_id,
                })?;
            pre_orders += product.price * line.quantity as f64;
        }

        let guests = selection.guest_count();
        let base = rate * guests as f64;
        Ok(LoungeFare {
            lounge_id: lounge.lounge_id,
            guests,
            rate_per_guest: round_money(rate),
            pre_orders: round_money(pre_orders),
            total: round_money(base + pre_orders),
        })
    }

    /// Builds the frozen snapshot for a whole selection.
    pub fn snapshot(
        &self,
        bus: Option<(&BusSelection, &TripListing)>,
        lounges: &[(LoungeLeg, &LoungeSelection, &LoungeListing)],
    ) -> Result<PriceSnapshot, PricingError> {
        let currency = bus
            .map(|(_, trip)| trip.currency.clone())
            .or_else(|| lounges.first().map(|(_, _, l)| l.currency.clone()))
            .unwrap_or_else(|| self.config.default_currency.clone());

        let (seat_fares, bus_fare) = match bus {
            Some((selection, trip)) => self.bus_fare(selection, trip)?,
            None => (Vec::new(), 0.0),
        };

        let mut snapshot = PriceSnapshot {
            seat_fares,
            bus_fare,
            pre_trip_lounge: None,
            post_trip_lounge: None,
            total: 0.0,
            currency,
        };

        for (leg, selection, listing) in lounges {
            if listing.currency != snapshot.currency {
                return Err(PricingError::CurrencyMismatch {
                    expected: snapshot.currency.clone(),
                    found: listing.currency.clone(),
                });
            }
            let fare = self.lounge_fare(selection, listing)?;
            snapshot = snapshot.with_lounge_fare(*leg, fare);
        }
        snapshot.total = snapshot.computed_total();
        Ok(snapshot)
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("Seat {0} is not part of this trip")]
    UnknownSeat(String),

    #[error("Lounge {lounge_id} has no {pricing_type} rate")]
    UnknownRate {
        lounge_id: Uuid,
        pricing_type: String,
    },

    #[error("Product {product_id} is not sold at lounge {lounge_id}")]
    UnknownProduct {
        lounge_id: Uuid,
        product_id: Uuid,
    },

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch {
        expected: String,
        found: String,
    },
}
