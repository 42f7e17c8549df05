use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub booking_rules: BookingRules,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// Knobs of the booking engine. Every field has a default so a partial
/// `[booking_rules]` table is valid.
#[derive(Debug, Deserialize, Clone)]
pub struct BookingRules {
    #[serde(default = "default_intent_ttl")]
    pub intent_ttl_seconds: u64,
    #[serde(default = "default_payment_extension")]
    pub payment_extension_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: usize,
    #[serde(default = "default_max_seats")]
    pub max_seats_per_intent: usize,
    #[serde(default = "default_alternatives")]
    pub alternatives_limit: usize,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
    /// How long an intent may sit in `confirming` before the sweeper resumes it.
    #[serde(default = "default_confirmation_grace")]
    pub confirmation_grace_seconds: u64,
}

fn default_intent_ttl() -> u64 { 600 }
fn default_payment_extension() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 30 }
fn default_sweep_batch() -> usize { 100 }
fn default_max_seats() -> usize { 10 }
fn default_alternatives() -> usize { 5 }
fn default_rate_limit() -> i64 { 30 }
fn default_confirmation_grace() -> u64 { 120 }

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            intent_ttl_seconds: default_intent_ttl(),
            payment_extension_seconds: default_payment_extension(),
            sweep_interval_seconds: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
            max_seats_per_intent: default_max_seats(),
            alternatives_limit: default_alternatives(),
            rate_limit_per_minute: default_rate_limit(),
            confirmation_grace_seconds: default_confirmation_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Shared secret the gateway presents on webhook callbacks.
    pub webhook_secret: String,
    pub checkout_base_url: String,
    /// Front-end page the browser is sent to after returning from checkout.
    pub return_redirect_base: String,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_failure_threshold: usize,
    #[serde(default = "default_circuit_reset")]
    pub circuit_reset_seconds: u64,
}

fn default_circuit_threshold() -> usize { 5 }
fn default_circuit_reset() -> u64 { 30 }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. TRANSIT__DATABASE__URL=postgres://...
            .add_source(config::Environment::with_prefix("TRANSIT").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
