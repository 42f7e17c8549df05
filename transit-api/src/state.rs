use std::sync::Arc;
use std::time::Duration;
use transit_order::BookingOrchestrator;
use transit_store::RedisClient;

use crate::middleware::resiliency::CircuitBreaker;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

/// Per-deployment knobs the HTTP layer reads directly.
#[derive(Clone)]
pub struct HttpSettings {
    /// Front-end page the browser lands on after checkout.
    pub return_redirect_base: String,
    pub rate_limit_per_minute: i64,
}

pub struct ResiliencyState {
    pub payment_cb: CircuitBreaker,
}

impl ResiliencyState {
    pub fn new(failure_threshold: usize, reset_after: Duration) -> Self {
        Self {
            payment_cb: CircuitBreaker::new("payment-gateway", failure_threshold, reset_after),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BookingOrchestrator>,
    /// Optional: rate limiting is skipped when absent.
    pub redis: Option<Arc<RedisClient>>,
    pub auth: AuthConfig,
    pub http: HttpSettings,
    pub resiliency: Arc<ResiliencyState>,
}
