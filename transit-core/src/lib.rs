pub mod audit;
pub mod capacity;
pub mod clock;
pub mod intent;
pub mod inventory;
pub mod payment;
pub mod repository;

/// Failure reported by any storage-backed collaborator (intent store,
/// capacity ledger, audit log, booking writer, inventory reads).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage conflict: {0}")]
    Conflict(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rounds a currency amount to two decimals.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
