use axum::{
    http::Method,
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod error;
pub mod intents;
pub mod middleware;
pub mod state;
pub mod webhooks;
pub mod worker;

pub use state::AppState;

use middleware::{
    admin_auth_middleware, circuit_breaker_middleware, customer_auth_middleware, intent_rate_limit_middleware,
};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
            axum::http::HeaderName::from_static("idempotency-key"),
        ]);

    // Layers run bottom-up: auth first, then the gateway breaker.
    let customer = Router::new()
        .route(
            "/v1/intents",
            post(intents::create_intent).layer(from_fn_with_state(state.clone(), intent_rate_limit_middleware)),
        )
        .route("/v1/intents/{id}", get(intents::get_intent))
        .route("/v1/intents/{id}/payment", post(intents::initiate_payment))
        .route("/v1/intents/{id}/cancel", post(intents::cancel_intent))
        .route("/v1/intents/{id}/lounges", post(intents::add_lounge))
        .route("/v1/intents/{id}/confirm", post(intents::confirm_booking))
        .layer(from_fn_with_state(state.clone(), circuit_breaker_middleware))
        .layer(from_fn_with_state(state.clone(), customer_auth_middleware));

    let admin = Router::new()
        .route("/v1/admin/intents/{id}", get(admin::get_intent))
        .route("/v1/admin/intents/{id}/refund", post(admin::initiate_refund))
        .route("/v1/admin/intents/{id}/refund/complete", post(admin::complete_refund))
        .route("/v1/admin/intents/{id}/audit", get(admin::audit_trail))
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    let public = Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/v1/webhooks/payments", post(webhooks::handle_payment_webhook))
        .route("/v1/payments/return", get(webhooks::payment_return));

    Router::new()
        .merge(customer)
        .merge(admin)
        .merge(public)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
