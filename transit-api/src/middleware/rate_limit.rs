use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::middleware::auth::CurrentUser;
use crate::state::AppState;

/// Per-customer fixed window on intent creation. Runs inside the customer
/// auth layer. Fails open when Redis is absent or unreachable.
pub async fn intent_rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (Some(redis), Some(user)) = (&state.redis, req.extensions().get::<CurrentUser>().copied()) else {
        return next.run(req).await;
    };

    let key = format!("ratelimit:intents:{}", user.user_id);
    match redis.check_rate_limit(&key, state.http.rate_limit_per_minute, 60).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            tracing::warn!(user_id = %user.user_id, "Intent creation rate limit exceeded");
            (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rate limiter unavailable; allowing request");
            next.run(req).await
        }
    }
}
