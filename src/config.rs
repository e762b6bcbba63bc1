use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_PROCESSOR_API_BASE: &str = "https://api.stripe.com";
const DEV_DEFAULT_JWT_SECRET: &str =
    "this_is_a_development_secret_key_that_is_at_least_64_characters_long_for_testing";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Secret used to verify organizer bearer tokens (HS256)
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Expected `iss` claim of organizer tokens
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment; also the fee-config cache partition
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Public base URL of the guest-facing site, used for checkout return URLs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Settlement currency (ISO 4217, lowercase as the processor expects)
    #[serde(default = "default_currency")]
    #[validate(custom = "validate_currency")]
    pub currency: String,

    // ========== Fee configuration cache ==========
    /// Fresh window of the cached fee configuration
    #[serde(default = "default_fee_cache_ttl_secs")]
    pub fee_cache_ttl_secs: u64,

    /// Window during which a stale fee configuration is still served if the store fails
    #[serde(default = "default_fee_cache_failsafe_secs")]
    pub fee_cache_failsafe_secs: u64,

    /// Upper bound for a single fee configuration read
    #[serde(default = "default_fee_store_timeout_ms")]
    pub fee_store_timeout_ms: u64,

    // ========== Payment processor ==========
    /// Base URL of the processor REST API
    #[serde(default = "default_processor_api_base")]
    pub processor_api_base: String,

    /// Processor secret API key
    #[serde(default)]
    pub processor_secret_key: Option<String>,

    /// Per-request timeout for processor calls (seconds)
    #[serde(default = "default_processor_timeout_secs")]
    pub processor_timeout_secs: u64,

    /// Attempts for transient processor failures (same idempotency key)
    #[serde(default = "default_processor_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub processor_max_attempts: u32,

    /// Base delay of the exponential retry backoff (milliseconds)
    #[serde(default = "default_processor_retry_base_delay_ms")]
    pub processor_retry_base_delay_ms: u64,

    /// Lifetime of a checkout session (the processor enforces 30 minutes minimum)
    #[serde(default = "default_checkout_session_expiry_minutes")]
    #[validate(range(min = 30, max = 1440))]
    pub checkout_session_expiry_minutes: i64,

    /// Width of the idempotency time bucket for checkout-session creation
    #[serde(default = "default_idempotency_window_secs")]
    #[validate(range(min = 1))]
    pub idempotency_window_secs: i64,

    // ========== Settlement ==========
    /// Fixed UTC offset (minutes) defining a settlement "calendar day" and CSV timestamps
    #[serde(default)]
    #[validate(range(min = -720, max = 840))]
    pub settlement_utc_offset_minutes: i32,

    /// Upper bound for a single settlement CSV export
    #[serde(default = "default_settlement_export_max_rows")]
    #[validate(range(min = 1, max = 100000))]
    pub settlement_export_max_rows: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            jwt_secret,
            auth_issuer: default_auth_issuer(),
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            public_base_url: default_public_base_url(),
            currency: default_currency(),
            fee_cache_ttl_secs: default_fee_cache_ttl_secs(),
            fee_cache_failsafe_secs: default_fee_cache_failsafe_secs(),
            fee_store_timeout_ms: default_fee_store_timeout_ms(),
            processor_api_base: default_processor_api_base(),
            processor_secret_key: None,
            processor_timeout_secs: default_processor_timeout_secs(),
            processor_max_attempts: default_processor_max_attempts(),
            processor_retry_base_delay_ms: default_processor_retry_base_delay_ms(),
            checkout_session_expiry_minutes: default_checkout_session_expiry_minutes(),
            idempotency_window_secs: default_idempotency_window_secs(),
            settlement_utc_offset_minutes: 0,
            settlement_export_max_rows: default_settlement_export_max_rows(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn fee_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fee_cache_ttl_secs)
    }

    pub fn fee_cache_failsafe(&self) -> Duration {
        Duration::from_secs(self.fee_cache_failsafe_secs)
    }

    pub fn fee_store_timeout(&self) -> Duration {
        Duration::from_millis(self.fee_store_timeout_ms)
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_timeout_secs)
    }

    pub fn processor_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.processor_retry_base_delay_ms)
    }

    pub fn checkout_session_expiry(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.checkout_session_expiry_minutes)
    }

    pub fn settlement_offset(&self) -> chrono::FixedOffset {
        use chrono::Offset;

        chrono::FixedOffset::east_opt(self.settlement_utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::Utc.fix())
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.is_production() && self.processor_secret_key.is_none() {
            let mut err = ValidationError::new("processor_secret_key_required");
            err.message = Some("Set APP__PROCESSOR_SECRET_KEY in production".into());
            errors.add("processor_secret_key", err);
        }

        if self.fee_cache_failsafe_secs < self.fee_cache_ttl_secs {
            let mut err = ValidationError::new("fee_cache_failsafe_secs");
            err.message = Some("fee_cache_failsafe_secs must be >= fee_cache_ttl_secs".into());
            errors.add("fee_cache_failsafe_secs", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_auth_issuer() -> String {
    "eventpay-api".to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_fee_cache_ttl_secs() -> u64 {
    600
}

fn default_fee_cache_failsafe_secs() -> u64 {
    3600
}

fn default_fee_store_timeout_ms() -> u64 {
    2000
}

fn default_processor_api_base() -> String {
    DEFAULT_PROCESSOR_API_BASE.to_string()
}

fn default_processor_timeout_secs() -> u64 {
    15
}

fn default_processor_max_attempts() -> u32 {
    3
}

fn default_processor_retry_base_delay_ms() -> u64 {
    250
}

fn default_checkout_session_expiry_minutes() -> i64 {
    30
}

fn default_idempotency_window_secs() -> i64 {
    600
}

fn default_settlement_export_max_rows() -> u64 {
    1000
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_lowercase()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a lowercase 3-letter ISO code".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("eventpay_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(CONFIG_DIR, &run_env)
}

fn load_config_from(config_dir: &str, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    // jwt_secret has no default outside development
    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://eventpay.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?;

    if run_env.eq_ignore_ascii_case(DEFAULT_ENV) {
        builder = builder.set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?;
    }

    let config = builder
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET (minimum 32 characters).");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "an_organizer_token_secret_long_enough_for_hs256".into(),
            "production".into(),
        )
    }

    #[test]
    fn production_requires_processor_key() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());

        let mut cfg = base_config();
        cfg.processor_secret_key = Some("sk_live_x".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn dev_secret_rejected_outside_development() {
        let mut cfg = base_config();
        cfg.processor_secret_key = Some("sk_live_x".into());
        cfg.jwt_secret = DEV_DEFAULT_JWT_SECRET.into();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn failsafe_window_must_cover_ttl() {
        let mut cfg = base_config();
        cfg.processor_secret_key = Some("sk_live_x".into());
        cfg.fee_cache_ttl_secs = 600;
        cfg.fee_cache_failsafe_secs = 60;
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn settlement_offset_defaults_to_utc() {
        let cfg = base_config();
        assert_eq!(cfg.settlement_offset().local_minus_utc(), 0);
    }

    #[test]
    fn loads_layered_file_config() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir(&config_dir).unwrap();
        fs::write(
            config_dir.join("default.toml"),
            r#"
                database_url = "sqlite::memory:"
                fee_cache_ttl_secs = 120
            "#,
        )
        .unwrap();
        fs::write(
            config_dir.join("development.toml"),
            r#"
                port = 9090
                currency = "jpy"
            "#,
        )
        .unwrap();

        let cfg = load_config_from(config_dir.to_str().unwrap(), "development").unwrap();
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.currency, "jpy");
        assert_eq!(cfg.fee_cache_ttl_secs, 120);
        assert_eq!(cfg.fee_cache_failsafe_secs, 3600);
    }

    #[test]
    fn export_row_cap_is_bounded() {
        let mut cfg = base_config();
        assert!(cfg.validate().is_ok());

        cfg.settlement_export_max_rows = 0;
        assert!(cfg.validate().is_err());

        cfg.settlement_export_max_rows = u64::MAX;
        assert!(cfg.validate().is_err());

        cfg.settlement_export_max_rows = 100_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_oversized_export_cap_from_file() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir(&config_dir).unwrap();
        fs::write(
            config_dir.join("development.toml"),
            "settlement_export_max_rows = 5000000\n",
        )
        .unwrap();

        let result = load_config_from(config_dir.to_str().unwrap(), "development");
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }

    #[test]
    fn rejects_invalid_currency() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir(&config_dir).unwrap();
        fs::write(config_dir.join("development.toml"), "currency = \"US\"\n").unwrap();

        let result = load_config_from(config_dir.to_str().unwrap(), "development");
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }
}
