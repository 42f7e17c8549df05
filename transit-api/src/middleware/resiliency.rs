use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    /// One trial request is let through.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: usize,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Fails payment calls fast once the gateway keeps returning server errors.
pub struct CircuitBreaker {
    pub name: String,
    failure_threshold: usize,
    reset_after: Duration,
    inner: Mutex<Breaker>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: usize, reset_after: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            reset_after,
            inner: Mutex::new(Breaker {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Whether a request may proceed.
    pub async fn check(&self) -> bool {
        let mut breaker = self.inner.lock().await;
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = breaker.opened_at.is_some_and(|at| at.elapsed() >= self.reset_after);
                if !cooled {
                    return false;
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.trial_in_flight = true;
                tracing::info!("Circuit Breaker [{}] moving to Half-Open", self.name);
                true
            }
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight {
                    return false;
                }
                breaker.trial_in_flight = true;
                true
            }
        }
    }

    pub async fn record_success(&self) {
        let mut breaker = self.inner.lock().await;
        if breaker.state != CircuitState::Closed {
            tracing::info!("Circuit Breaker [{}] recovered to Closed", self.name);
        }
        breaker.state = CircuitState::Closed;
        breaker.failures = 0;
        breaker.opened_at = None;
        breaker.trial_in_flight = false;
    }

    pub async fn record_failure(&self) {
        let mut breaker = self.inner.lock().await;
        breaker.failures += 1;
        breaker.trial_in_flight = false;

        if breaker.failures >= self.failure_threshold || breaker.state == CircuitState::HalfOpen {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
            tracing::error!(
                "Circuit Breaker [{}] TRIPPED to Open. Failures: {}",
                self.name,
                breaker.failures
            );
        }
    }
}

fn guards_gateway(path: &str) -> bool {
    path.starts_with("/v1/intents/") && (path.ends_with("/payment") || path.ends_with("/confirm"))
}

/// Only an upstream gateway failure counts against the breaker.
fn is_gateway_failure(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY
}

pub async fn circuit_breaker_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !guards_gateway(req.uri().path()) {
        return next.run(req).await;
    }

    let cb = &state.resiliency.payment_cb;
    if !cb.check().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "processing", "error": format!("Circuit Breaker [{}] is OPEN", cb.name) })),
        )
            .into_response();
    }

    let response = next.run(req).await;
    if is_gateway_failure(response.status()) {
        cb.record_failure().await;
    } else {
        cb.record_success().await;
    }
    response
}
