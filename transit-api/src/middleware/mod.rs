pub mod auth;
pub mod rate_limit;
pub mod resiliency;

pub use auth::{admin_auth_middleware, customer_auth_middleware, AdminClaims, CurrentUser, CustomerClaims};
pub use rate_limit::intent_rate_limit_middleware;
pub use resiliency::circuit_breaker_middleware;
