//! Connection checkout validator
//!
//! Background task that periodically opens and closes a connection
//! through a fresh data context, so a broken database shows up in the
//! logs (and metrics) before the first real request hits it.
//!
//! Database failures are logged and the next tick proceeds. Any other
//! failure (bad configuration, internal errors) stops the task and is
//! returned to whoever awaits it. Shutdown interrupts a checkout that is
//! still in flight.
//!
//! # Example
//!
//! ```ignore
//! let checkout = ConnectionCheckout::new(factory, CheckoutConfig::default());
//! let handle = checkout.spawn();
//!
//! // Later, on shutdown
//! let report = handle.stop().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::{CheckoutSettings, DEFAULT_CHECKOUT_INTERVAL_SECS};
use crate::data::{ContextFactory, DataContext};
use crate::error::{DataError, Result};
use crate::metrics::CHECKOUT_TICKS_TOTAL;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutConfig {
    /// Time between checkouts; the first one runs one interval after start
    pub interval: Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_CHECKOUT_INTERVAL_SECS),
        }
    }
}

impl From<&CheckoutSettings> for CheckoutConfig {
    fn from(settings: &CheckoutSettings) -> Self {
        Self {
            interval: settings.interval(),
        }
    }
}

/// Outcome counts over the lifetime of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckoutReport {
    pub succeeded: u64,
    pub failed: u64,
}

// =============================================================================
// Validator
// =============================================================================

pub struct ConnectionCheckout<F> {
    factory: Arc<F>,
    config: CheckoutConfig,
}

impl<F: ContextFactory> ConnectionCheckout<F> {
    pub fn new(factory: Arc<F>, config: CheckoutConfig) -> Self {
        Self { factory, config }
    }

    /// Open and close one connection through a fresh context
    ///
    /// The context is disposed whatever the outcome.
    pub async fn check_once(&self) -> Result<()> {
        let mut context = self.factory.create()?;

        let outcome = async {
            let handle = context.get_connection().await?;
            handle.close().await
        }
        .await;

        context.dispose().await;
        outcome
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped
    ///
    /// A checkout still running at that point is dropped unfinished.
    ///
    /// # Errors
    /// The first non-database error raised by a checkout
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<CheckoutReport> {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report = CheckoutReport::default();

        tracing::info!(
            interval_secs = period.as_secs(),
            "Connection checkout started"
        );

        if *shutdown.borrow() {
            return Ok(report);
        }

        loop {
            let outcome = tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => break,

                _ = ticker.tick() => tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => {
                        tracing::warn!("Connection checkout interrupted by shutdown");
                        break;
                    }

                    outcome = self.check_once() => outcome,
                },
            };

            match outcome {
                Ok(()) => {
                    report.succeeded += 1;
                    CHECKOUT_TICKS_TOTAL.with_label_values(&["success"]).inc();
                    tracing::debug!("Connection checkout succeeded");
                }
                Err(error) if error.is_database_error() => {
                    report.failed += 1;
                    CHECKOUT_TICKS_TOTAL.with_label_values(&["failure"]).inc();
                    tracing::error!(%error, "Errors during connection checkout");
                }
                Err(error) => {
                    CHECKOUT_TICKS_TOTAL.with_label_values(&["fatal"]).inc();
                    tracing::error!(%error, "Connection checkout aborted");
                    return Err(error);
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Connection checkout stopped"
        );
        Ok(report)
    }

    /// Run on the tokio runtime until the returned handle is stopped
    pub fn spawn(self) -> CheckoutHandle {
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(receiver).await });

        CheckoutHandle {
            shutdown,
            task: Some(task),
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Handle to a spawned validator
pub struct CheckoutHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<CheckoutReport>>>,
}

impl CheckoutHandle {
    /// Whether the task has ended (stopped or failed)
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the task to end on its own, without requesting shutdown
    ///
    /// Only a fatal error ends the task unprompted, so this is meant to be
    /// raced against the caller's own shutdown signal. Cancel safe.
    ///
    /// # Errors
    /// The error that ended the task, or `Internal` if it was already joined
    pub async fn wait(&mut self) -> Result<CheckoutReport> {
        let task = self.task.as_mut().ok_or_else(already_joined)?;
        let joined = task.await;
        self.task = None;
        joined.map_err(join_failed)?
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn stop(mut self) -> Result<CheckoutReport> {
        // The task may already have ended on a fatal error
        let _ = self.shutdown.send(true);

        let task = self.task.take().ok_or_else(already_joined)?;
        task.await.map_err(join_failed)?
    }
}

fn already_joined() -> DataError {
    DataError::Internal(anyhow::anyhow!("connection checkout task already joined"))
}

fn join_failed(error: tokio::task::JoinError) -> DataError {
    DataError::Internal(anyhow::anyhow!("connection checkout task failed: {}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::data::{
        Command, ConnectionHandle, IsolationLevel, JoinedRows, RowCursor, SplitRow, SqliteContext,
        SqliteContextFactory, Transaction,
    };
    use async_trait::async_trait;
    use mockall::mock;
    use sqlx::FromRow;
    use sqlx::sqlite::SqliteRow;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    mock! {
        Factory {}

        impl ContextFactory for Factory {
            type Context = SqliteContext;

            fn create(&self) -> Result<SqliteContext>;
        }
    }

    /// Context whose connection never opens
    struct StalledContext {
        entered: Arc<Notify>,
    }

    fn unsupported<T>() -> Result<T> {
        Err(DataError::Unsupported("stalled test context".to_string()))
    }

    #[async_trait]
    impl DataContext for StalledContext {
        async fn execute_reader<'c>(&'c mut self, _cmd: Command<'c>) -> Result<RowCursor<'c>> {
            unsupported()
        }

        async fn get_connection(&mut self) -> Result<&mut ConnectionHandle> {
            self.entered.notify_one();
            std::future::pending().await
        }

        async fn get_many<T>(&mut self, _cmd: Command<'_>) -> Result<Vec<T>>
        where
            T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
        {
            unsupported()
        }

        async fn get_many_joined<'c, P, R, F>(
            &'c mut self,
            _cmd: Command<'c>,
            _map: F,
        ) -> Result<JoinedRows<'c, R>>
        where
            P: SplitRow + Send + 'c,
            R: Send + 'c,
            F: FnMut(P) -> R + Send + 'c,
        {
            unsupported()
        }

        async fn get_one<T>(&mut self, _cmd: Command<'_>) -> Result<Option<T>>
        where
            T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
        {
            unsupported()
        }

        async fn get_one_joined<P, R, F>(&mut self, _cmd: Command<'_>, _map: F) -> Result<Option<R>>
        where
            P: SplitRow + Send,
            R: Send,
            F: FnOnce(P) -> R + Send,
        {
            unsupported()
        }

        async fn get_scalar<T>(&mut self, _cmd: Command<'_>) -> Result<Option<T>>
        where
            T: Send + Unpin,
            (T,): for<'r> FromRow<'r, SqliteRow>,
        {
            unsupported()
        }

        async fn execute(&mut self, _cmd: Command<'_>) -> Result<u64> {
            unsupported()
        }

        async fn execute_returning<T>(&mut self, _cmd: Command<'_>) -> Result<T>
        where
            T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
        {
            unsupported()
        }

        async fn begin_transaction(&mut self, _level: IsolationLevel) -> Result<Transaction> {
            unsupported()
        }

        async fn commit_transaction(&mut self, _transaction: Transaction) -> Result<()> {
            unsupported()
        }

        async fn rollback_transaction(&mut self, _transaction: Transaction) -> Result<()> {
            unsupported()
        }

        async fn dispose(&mut self) {}
    }

    struct StalledFactory {
        entered: Arc<Notify>,
    }

    impl ContextFactory for StalledFactory {
        type Context = StalledContext;

        fn create(&self) -> Result<StalledContext> {
            Ok(StalledContext {
                entered: Arc::clone(&self.entered),
            })
        }
    }

    fn short(millis: u64) -> CheckoutConfig {
        CheckoutConfig {
            interval: Duration::from_millis(millis),
        }
    }

    fn reachable_factory(temp_dir: &TempDir) -> Arc<SqliteContextFactory> {
        let db_path = temp_dir.path().join("checkout.db");
        Arc::new(SqliteContextFactory::new(ClientOptions::new(format!(
            "sqlite://{}?mode=rwc",
            db_path.display()
        ))))
    }

    fn unreachable_factory() -> Arc<SqliteContextFactory> {
        Arc::new(SqliteContextFactory::new(ClientOptions::new(
            "sqlite:///nonexistent/dir/db.sqlite?mode=ro",
        )))
    }

    #[tokio::test]
    async fn test_check_once_reachable() {
        let temp_dir = TempDir::new().unwrap();
        let checkout = ConnectionCheckout::new(reachable_factory(&temp_dir), short(10));

        checkout.check_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_once_unreachable_is_database_error() {
        let checkout = ConnectionCheckout::new(unreachable_factory(), short(10));

        let error = checkout.check_once().await.unwrap_err();
        assert!(error.is_database_error());
    }

    #[tokio::test]
    async fn test_checkout_runs_periodically() {
        let temp_dir = TempDir::new().unwrap();
        let handle = ConnectionCheckout::new(reachable_factory(&temp_dir), short(20)).spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let report = handle.stop().await.unwrap();

        assert!(report.succeeded >= 2, "report: {:?}", report);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_database_failures_do_not_stop_the_loop() {
        let handle = ConnectionCheckout::new(unreachable_factory(), short(20)).spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());

        let report = handle.stop().await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert!(report.failed >= 2, "report: {:?}", report);
    }

    #[tokio::test]
    async fn test_non_database_error_is_fatal() {
        let mut factory = MockFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|| Err(DataError::Config("no connection string".to_string())));

        let checkout = ConnectionCheckout::new(Arc::new(factory), short(10));
        let (_shutdown, receiver) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(5), checkout.run(receiver))
            .await
            .unwrap();
        assert!(matches!(result, Err(DataError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_interrupts_a_stalled_checkout() {
        let entered = Arc::new(Notify::new());
        let factory = Arc::new(StalledFactory {
            entered: Arc::clone(&entered),
        });
        let handle = ConnectionCheckout::new(factory, short(10)).spawn();

        tokio::time::timeout(Duration::from_secs(1), entered.notified())
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report, CheckoutReport::default());
    }

    #[tokio::test]
    async fn test_wait_returns_fatal_error() {
        let mut factory = MockFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|| Err(DataError::Config("no connection string".to_string())));

        let mut handle = ConnectionCheckout::new(Arc::new(factory), short(10)).spawn();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(DataError::Config(_))));
        assert!(handle.is_finished());

        // Already joined
        assert!(matches!(handle.stop().await, Err(DataError::Internal(_))));
    }

    #[tokio::test]
    async fn test_wait_is_cancel_safe() {
        let temp_dir = TempDir::new().unwrap();
        let mut handle = ConnectionCheckout::new(reachable_factory(&temp_dir), short(20)).spawn();

        // Still running: the wait times out and the handle stays usable
        assert!(
            tokio::time::timeout(Duration::from_millis(80), handle.wait())
                .await
                .is_err()
        );

        let report = handle.stop().await.unwrap();
        assert!(report.succeeded >= 1, "report: {:?}", report);
    }

    #[tokio::test]
    async fn test_first_check_waits_one_interval() {
        let temp_dir = TempDir::new().unwrap();
        let handle =
            ConnectionCheckout::new(reachable_factory(&temp_dir), CheckoutConfig::default())
                .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report, CheckoutReport::default());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_the_loop() {
        let checkout = ConnectionCheckout::new(unreachable_factory(), CheckoutConfig::default());
        let (shutdown, receiver) = watch::channel(false);
        drop(shutdown);

        let report = tokio::time::timeout(Duration::from_secs(1), checkout.run(receiver))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report, CheckoutReport::default());
    }

    #[test]
    fn test_config_from_settings() {
        let settings = CheckoutSettings {
            enabled: true,
            interval_seconds: 90,
        };

        assert_eq!(
            CheckoutConfig::from(&settings).interval,
            Duration::from_secs(90)
        );
        assert_eq!(
            CheckoutConfig::default().interval,
            Duration::from_secs(3600)
        );
    }
}
