pub mod app_config;
pub mod audit_repo;
pub mod booking_repo;
pub mod capacity_repo;
pub mod database;
pub mod intent_repo;
pub mod inventory_repo;
pub mod memory;
pub mod redis_repo;

pub use audit_repo::PgPaymentAuditLog;
pub use booking_repo::PgBookingWriter;
pub use capacity_repo::PgCapacityLedger;
pub use database::DbClient;
pub use intent_repo::PgIntentRepository;
pub use inventory_repo::PgInventory;
pub use memory::{MemoryBookingWriter, MemoryIntentRepository, MemoryPaymentAuditLog};
pub use redis_repo::RedisClient;
