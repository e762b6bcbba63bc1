use crate::{
    config::AppConfig,
    errors::ServiceError,
    models::fee_config::{self, Entity as FeeConfigEntity},
};
use async_trait::async_trait;
use metrics::counter;
use sea_orm::{sea_query::OnConflict, DatabaseConnection, EntityTrait, IntoActiveModel};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use super::fee_calculator::FeeConfig;

/// Backing store for the fee configuration.
#[async_trait]
pub trait FeeConfigSource: Send + Sync {
    async fn load(&self) -> Result<FeeConfig, ServiceError>;
    async fn save(&self, config: &FeeConfig) -> Result<FeeConfig, ServiceError>;
}

pub struct DbFeeConfigSource {
    db: Arc<DatabaseConnection>,
}

impl DbFeeConfigSource {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FeeConfigSource for DbFeeConfigSource {
    async fn load(&self) -> Result<FeeConfig, ServiceError> {
        FeeConfigEntity::find_by_id(fee_config::SINGLETON_ID)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .map(FeeConfig::from)
            .ok_or_else(|| ServiceError::NotFound("Fee configuration has not been set up".into()))
    }

    async fn save(&self, config: &FeeConfig) -> Result<FeeConfig, ServiceError> {
        let row = config.to_row().into_active_model();
        FeeConfigEntity::insert(row)
            .on_conflict(
                OnConflict::column(fee_config::Column::Id)
                    .update_columns([
                        fee_config::Column::ProcessorRateBps,
                        fee_config::Column::ProcessorFixedFee,
                        fee_config::Column::PlatformRateBps,
                        fee_config::Column::PlatformFixedFee,
                        fee_config::Column::PlatformMinimumFee,
                        fee_config::Column::PlatformMaximumFee,
                        fee_config::Column::MinimumPayoutAmount,
                        fee_config::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        self.load().await
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    config: FeeConfig,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct FeeCachePolicy {
    pub ttl: Duration,
    /// How long a stale entry may still be served while the store is failing
    pub failsafe: Duration,
    pub load_timeout: Duration,
}

impl Default for FeeCachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            failsafe: Duration::from_secs(3600),
            load_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&AppConfig> for FeeCachePolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            ttl: cfg.fee_cache_ttl(),
            failsafe: cfg.fee_cache_failsafe(),
            load_timeout: cfg.fee_store_timeout(),
        }
    }
}

/// Process-wide fee configuration cache, keyed by environment name.
pub struct FeeConfigStore {
    source: Arc<dyn FeeConfigSource>,
    environment: String,
    policy: FeeCachePolicy,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl FeeConfigStore {
    pub fn new(
        source: Arc<dyn FeeConfigSource>,
        environment: impl Into<String>,
        policy: FeeCachePolicy,
    ) -> Self {
        Self {
            source,
            environment: environment.into(),
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the current config, serving a stale entry inside the
    /// fail-safe window when the store is unreachable.
    pub async fn get_config(&self, force_refresh: bool) -> Result<FeeConfig, ServiceError> {
        if !force_refresh {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&self.environment) {
                if entry.fetched_at.elapsed() < self.policy.ttl {
                    return Ok(entry.config.clone());
                }
            }
        }

        let loaded = match tokio::time::timeout(self.policy.load_timeout, self.source.load()).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::ServiceUnavailable(format!(
                "Fee configuration store did not answer within {:?}",
                self.policy.load_timeout
            ))),
        };

        match loaded {
            Ok(config) => {
                self.entries.write().await.insert(
                    self.environment.clone(),
                    CacheEntry {
                        config: config.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(config)
            }
            Err(err) => self.serve_stale(err).await,
        }
    }

    async fn serve_stale(&self, err: ServiceError) -> Result<FeeConfig, ServiceError> {
        let entries = self.entries.read().await;
        match entries.get(&self.environment) {
            Some(entry) if entry.fetched_at.elapsed() < self.policy.failsafe => {
                counter!("eventpay_fee_config.degraded_reads", 1);
                warn!(
                    environment = %self.environment,
                    age_secs = entry.fetched_at.elapsed().as_secs(),
                    error = %err,
                    "Serving stale fee configuration; store unavailable"
                );
                Ok(entry.config.clone())
            }
            _ => {
                error!(environment = %self.environment, error = %err, "Fee configuration unavailable");
                Err(err)
            }
        }
    }

    /// Drops the cached entry for the current environment.
    pub async fn invalidate(&self) {
        self.entries.write().await.remove(&self.environment);
        info!(environment = %self.environment, "Fee configuration cache invalidated");
    }

    #[instrument(skip(self, config))]
    pub async fn update_config(&self, config: FeeConfig) -> Result<FeeConfig, ServiceError> {
        config.validate()?;
        let saved = self.source.save(&config).await?;
        self.invalidate().await;
        info!(
            platform_rate = %saved.platform_rate,
            platform_fixed_fee = saved.platform_fixed_fee,
            "Fee configuration updated"
        );
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        config: Mutex<FeeConfig>,
        loads: AtomicUsize,
        failing: AtomicBool,
        hanging: AtomicBool,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                config: Mutex::new(config(30)),
                loads: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                hanging: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl FeeConfigSource for ScriptedSource {
        async fn load(&self) -> Result<FeeConfig, ServiceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.hanging.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ServiceError::db_error("connection refused"));
            }
            Ok(self.config.lock().unwrap().clone())
        }

        async fn save(&self, config: &FeeConfig) -> Result<FeeConfig, ServiceError> {
            *self.config.lock().unwrap() = config.clone();
            Ok(config.clone())
        }
    }

    fn config(fixed: i64) -> FeeConfig {
        FeeConfig {
            processor_rate: dec!(0.036),
            processor_fixed_fee: 0,
            platform_rate: dec!(0.03),
            platform_fixed_fee: fixed,
            platform_minimum_fee: 50,
            platform_maximum_fee: 500,
            minimum_payout_amount: 100,
        }
    }

    fn store(source: Arc<ScriptedSource>) -> FeeConfigStore {
        FeeConfigStore::new(source, "test", FeeCachePolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn cached_value_is_served_within_ttl() {
        let source = ScriptedSource::new();
        let store = store(source.clone());

        store.get_config(false).await.unwrap();
        tokio::time::advance(Duration::from_secs(599)).await;
        store.get_config(false).await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        store.get_config(false).await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_bypasses_cache() {
        let source = ScriptedSource::new();
        let store = store(source.clone());

        store.get_config(false).await.unwrap();
        store.get_config(true).await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_value_is_served_inside_failsafe_window() {
        let source = ScriptedSource::new();
        let store = store(source.clone());

        let fresh = store.get_config(false).await.unwrap();
        source.failing.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1800)).await;

        assert_eq!(store.get_config(false).await.unwrap(), fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn error_propagates_after_failsafe_window() {
        let source = ScriptedSource::new();
        let store = store(source.clone());

        store.get_config(false).await.unwrap();
        source.failing.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(3601)).await;

        assert!(matches!(
            store.get_config(false).await,
            Err(ServiceError::DatabaseError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn error_propagates_with_empty_cache() {
        let source = ScriptedSource::new();
        source.failing.store(true, Ordering::SeqCst);
        let store = store(source);

        assert!(store.get_config(false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_to_stale_value() {
        let source = ScriptedSource::new();
        let store = store(source.clone());

        let fresh = store.get_config(false).await.unwrap();
        source.hanging.store(true, Ordering::SeqCst);

        assert_eq!(store.get_config(true).await.unwrap(), fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn update_invalidates_and_next_read_sees_new_values() {
        let source = ScriptedSource::new();
        let store = store(source.clone());

        assert_eq!(store.get_config(false).await.unwrap().platform_fixed_fee, 30);
        store.update_config(config(45)).await.unwrap();
        assert_eq!(store.get_config(false).await.unwrap().platform_fixed_fee, 45);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn update_rejects_invalid_config() {
        let source = ScriptedSource::new();
        let store = store(source);

        let mut invalid = config(30);
        invalid.platform_maximum_fee = 10;
        assert!(matches!(
            store.update_config(invalid).await,
            Err(ServiceError::ValidationError(_))
        ));
    }
}
