pub mod inventory;
pub mod ledger;
pub mod pricing;

pub use inventory::StaticInventory;
pub use ledger::MemoryCapacityLedger;
pub use pricing::{PricingEngine, PricingError};
