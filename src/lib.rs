//! sqlcontext - unit-of-work data access over SQLite
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DataServices                           │
//! │  - Context factory (static or per-scope options)            │
//! │  - Shared entity cache                                      │
//! │  - Connection checkout validator                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Data Layer                            │
//! │  - Data context (one connection, lazy open)                 │
//! │  - Row mapping, joined rows split across types              │
//! │  - Moka entity cache with per-entry expiration              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SQLite (sqlx)                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `data`: Data contexts, commands, row mapping and the entity cache
//! - `checkout`: Periodic connection validator
//! - `config`: Configuration management
//! - `metrics`: Prometheus instruments
//! - `error`: Error types

pub mod checkout;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;

use std::sync::Arc;

pub use checkout::{CheckoutConfig, CheckoutHandle, CheckoutReport, ConnectionCheckout};
pub use config::{ClientOptions, Settings};
pub use data::{
    Command, ContextFactory, DataContext, EntityCache, IsolationLevel, MemoryCache, SqliteContext,
    SqliteContextFactory,
};
pub use error::{DataError, Result};

/// Data access services shared across the application
///
/// Cloning is cheap: the factory and the cache are shared, so every clone
/// hands out contexts for the same database and sees the same cache.
pub struct DataServices<F: ContextFactory = SqliteContextFactory> {
    /// Creates one data context per unit of work
    factory: Arc<F>,

    /// Process-wide entity cache
    cache: Arc<MemoryCache>,

    /// Validator schedule
    checkout: CheckoutConfig,
}

impl<F: ContextFactory> DataServices<F> {
    pub fn new(factory: F, cache: MemoryCache, checkout: CheckoutConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            cache: Arc::new(cache),
            checkout,
        }
    }

    /// Fresh, unopened data context
    pub fn context(&self) -> Result<F::Context> {
        self.factory.create()
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// Spawn the connection checkout validator
    pub fn start_checkout(&self) -> CheckoutHandle {
        ConnectionCheckout::new(Arc::clone(&self.factory), self.checkout).spawn()
    }
}

impl DataServices<SqliteContextFactory> {
    /// Every context uses `options`
    pub fn sqlite(options: ClientOptions) -> Self {
        Self::new(
            SqliteContextFactory::new(options),
            MemoryCache::default(),
            CheckoutConfig::default(),
        )
    }

    /// Options are resolved again for every context
    pub fn sqlite_scoped<R>(resolve: R) -> Self
    where
        R: Fn() -> Result<ClientOptions> + Send + Sync + 'static,
    {
        Self::new(
            SqliteContextFactory::scoped(resolve),
            MemoryCache::default(),
            CheckoutConfig::default(),
        )
    }

    /// Build from loaded settings
    ///
    /// # Errors
    /// `Config` if the database options are invalid
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.database.validate()?;

        Ok(Self::new(
            SqliteContextFactory::new(settings.database.clone()),
            MemoryCache::new(settings.cache.max_capacity),
            CheckoutConfig::from(&settings.checkout),
        ))
    }
}

impl<F: ContextFactory> Clone for DataServices<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            cache: Arc::clone(&self.cache),
            checkout: self.checkout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, CheckoutSettings, LoggingConfig};
    use std::time::Duration;
    use ulid::Ulid;

    fn settings(connection_string: &str) -> Settings {
        Settings {
            database: ClientOptions::new(connection_string),
            checkout: CheckoutSettings {
                enabled: true,
                interval_seconds: 120,
            },
            cache: CacheSettings { max_capacity: 10 },
            logging: LoggingConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_clones_share_cache() {
        let services = DataServices::sqlite(ClientOptions::new("sqlite::memory:"));
        let clone = services.clone();
        let id = Ulid::new();

        services
            .cache()
            .set(id, "shared".to_string(), Duration::from_secs(60))
            .await;

        assert_eq!(
            clone.cache().get::<String>(id).await.unwrap().as_str(),
            "shared"
        );
        assert!(Arc::ptr_eq(services.factory(), clone.factory()));
    }

    #[test]
    fn test_from_settings() {
        let services = DataServices::from_settings(&settings("sqlite::memory:")).unwrap();
        assert_eq!(services.checkout.interval, Duration::from_secs(120));

        let ctx = services.context().unwrap();
        assert_eq!(ctx.options().connection_string, "sqlite::memory:");
    }

    #[test]
    fn test_from_settings_rejects_invalid_options() {
        let result = DataServices::from_settings(&settings(""));
        assert!(matches!(result, Err(DataError::Config(_))));
    }
}
