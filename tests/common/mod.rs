//! Common test utilities for E2E tests

#![allow(dead_code)]

use sqlcontext::{
    CheckoutConfig, ClientOptions, Command, DataContext, DataServices, MemoryCache,
    SqliteContextFactory,
};
use std::time::Duration;
use tempfile::TempDir;

/// Test database instance
pub struct TestDatabase {
    pub services: DataServices,
    pub options: ClientOptions,
    pub _temp_dir: TempDir,
}

impl TestDatabase {
    /// Create a new database with the test schema applied
    pub async fn new() -> Self {
        Self::with_checkout_interval(Duration::from_secs(3600)).await
    }

    pub async fn with_checkout_interval(interval: Duration) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let options = connection_options(&temp_dir);

        let services = DataServices::new(
            SqliteContextFactory::new(options.clone()),
            MemoryCache::new(1_000),
            CheckoutConfig { interval },
        );

        let mut ctx = services.context().unwrap();
        ctx.execute(Command::new(
            "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT NOT NULL, active INTEGER NOT NULL)",
        ))
        .await
        .unwrap();
        ctx.execute(Command::new(
            "CREATE TABLE posts (id TEXT PRIMARY KEY, user_id TEXT NOT NULL, body TEXT NOT NULL)",
        ))
        .await
        .unwrap();
        ctx.dispose().await;

        Self {
            services,
            options,
            _temp_dir: temp_dir,
        }
    }
}

/// Options for a database file inside `temp_dir`
pub fn connection_options(temp_dir: &TempDir) -> ClientOptions {
    let db_path = temp_dir.path().join("test.db");
    ClientOptions::new(format!("sqlite://{}?mode=rwc", db_path.display()))
}
