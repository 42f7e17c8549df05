use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use transit_api::{
    app,
    state::{AppState, AuthConfig, HttpSettings, ResiliencyState},
    worker,
};
use transit_catalog::PricingEngine;
use transit_core::clock::SystemClock;
use transit_order::{BookingOrchestrator, Collaborators, IntentSweeper, MockPaymentGateway, OrchestratorRules};
use transit_store::{
    DbClient, PgBookingWriter, PgCapacityLedger, PgIntentRepository, PgInventory, PgPaymentAuditLog, RedisClient,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transit_api=debug,transit_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = transit_store::app_config::Config::load().expect("Failed to load config");
    tracing::info!("Starting Transit booking API on port {}", config.server.port);

    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to Postgres");
    db.migrate().await.expect("Failed to run migrations");

    // Redis is optional: without it rate limiting is off and every replica sweeps.
    let redis = match &config.redis {
        Some(redis) => match RedisClient::new(&redis.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable; continuing without it");
                None
            }
        },
        None => None,
    };

    let rules = &config.booking_rules;
    let clock = Arc::new(SystemClock);
    let intents = Arc::new(PgIntentRepository::new(db.pool.clone()));
    let ledger = Arc::new(PgCapacityLedger::new(db.pool.clone()));

    let collaborators = Collaborators {
        intents: intents.clone(),
        ledger: ledger.clone(),
        inventory: Arc::new(PgInventory::new(db.pool.clone())),
        gateway: Arc::new(MockPaymentGateway::new(
            config.gateway.webhook_secret.clone(),
            config.gateway.checkout_base_url.clone(),
        )),
        audit: Arc::new(PgPaymentAuditLog::new(db.pool.clone())),
        bookings: Arc::new(PgBookingWriter::new(db.pool.clone())),
        clock: clock.clone(),
    };
    let orchestrator = Arc::new(BookingOrchestrator::new(
        collaborators,
        PricingEngine::default(),
        OrchestratorRules {
            intent_ttl: chrono::Duration::seconds(rules.intent_ttl_seconds as i64),
            payment_extension: chrono::Duration::seconds(rules.payment_extension_seconds as i64),
            max_seats: rules.max_seats_per_intent,
            alternatives_limit: rules.alternatives_limit,
            ..OrchestratorRules::default()
        },
    ));

    let sweeper = IntentSweeper::new(intents, ledger, clock, rules.sweep_batch_size).with_confirmation_recovery(
        orchestrator.clone(),
        chrono::Duration::seconds(rules.confirmation_grace_seconds as i64),
    );
    tokio::spawn(worker::start_sweeper_worker(
        sweeper,
        redis.clone(),
        Duration::from_secs(rules.sweep_interval_seconds.max(1)),
    ));

    let app_state = AppState {
        orchestrator,
        redis,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        http: HttpSettings {
            return_redirect_base: config.gateway.return_redirect_base.clone(),
            rate_limit_per_minute: rules.rate_limit_per_minute,
        },
        resiliency: Arc::new(ResiliencyState::new(
            config.gateway.circuit_failure_threshold,
            Duration::from_secs(config.gateway.circuit_reset_seconds),
        )),
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
