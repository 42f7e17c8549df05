use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use transit_order::IntentSweeper;
use transit_store::RedisClient;
use uuid::Uuid;

const SWEEPER_LEASE_KEY: &str = "lease:intent-sweeper";

/// Runs the expiration sweeper forever. With Redis, a per-tick lease keeps
/// replicas from sweeping the same batch; a Redis failure sweeps anyway
/// since every write is compare-and-swap.
pub async fn start_sweeper_worker(sweeper: IntentSweeper, redis: Option<Arc<RedisClient>>, interval: Duration) {
    let holder = format!("sweeper-{}", Uuid::new_v4());
    let lease_seconds = interval.as_secs().max(1);
    info!(holder = %holder, interval_secs = interval.as_secs(), "Intent sweeper started");

    loop {
        let leader = match &redis {
            Some(redis) => match redis.acquire_lease(SWEEPER_LEASE_KEY, &holder, lease_seconds).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!(error = %e, "Sweeper lease unavailable; sweeping locally");
                    true
                }
            },
            None => true,
        };

        if leader {
            if let Err(e) = sweeper.sweep_once().await {
                error!(error = %e, "Intent sweep failed");
            }
        }

        sleep(interval).await;
    }
}
