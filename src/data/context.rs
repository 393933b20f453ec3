//! Data context
//!
//! A data context is the single point of contact with the database for
//! one logical unit of work. It owns exactly one connection, opened lazily
//! on first use, and must not be shared between concurrent callers.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::FromRow;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteRow};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::command::{Command, CommandType, IsolationLevel, Transaction};
use super::connection::{ConnectionHandle, ConnectionStatus};
use super::record::{Record, SplitRow, row_segments};
use crate::config::ClientOptions;
use crate::error::{DataError, Result};
use crate::metrics;

// =============================================================================
// Contract
// =============================================================================

/// Unit-of-work data access contract
///
/// Every operation fails with [`DataError::Disposed`] once the context has
/// been disposed. Commands run in the order they are issued.
#[async_trait]
pub trait DataContext: Send {
    /// Run a query and return a forward-only cursor over its rows
    async fn execute_reader<'c>(&'c mut self, cmd: Command<'c>) -> Result<RowCursor<'c>>;

    /// Open the connection (if needed) and hand it out
    async fn get_connection(&mut self) -> Result<&mut ConnectionHandle>;

    /// Map every row to `T`
    async fn get_many<T>(&mut self, cmd: Command<'_>) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin;

    /// Split every row into 2-4 types at the command's split column and combine them
    ///
    /// With buffering on, every row is read and mapped before this returns.
    /// Otherwise rows are read and mapped one at a time as the result is
    /// advanced.
    async fn get_many_joined<'c, P, R, F>(
        &'c mut self,
        cmd: Command<'c>,
        map: F,
    ) -> Result<JoinedRows<'c, R>>
    where
        P: SplitRow + Send + 'c,
        R: Send + 'c,
        F: FnMut(P) -> R + Send + 'c;

    /// First row mapped to `T`, or `None` when there are no rows
    async fn get_one<T>(&mut self, cmd: Command<'_>) -> Result<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin;

    /// First joined row, or `None` when there are no rows
    async fn get_one_joined<P, R, F>(&mut self, cmd: Command<'_>, map: F) -> Result<Option<R>>
    where
        P: SplitRow + Send,
        R: Send,
        F: FnOnce(P) -> R + Send;

    /// First column of the first row, or `None` when there are no rows
    async fn get_scalar<T>(&mut self, cmd: Command<'_>) -> Result<Option<T>>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, SqliteRow>;

    /// Run a statement and return the number of affected rows
    async fn execute(&mut self, cmd: Command<'_>) -> Result<u64>;

    /// Run a statement that must produce exactly one row
    async fn execute_returning<T>(&mut self, cmd: Command<'_>) -> Result<T>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin;

    /// Start a transaction on this context's connection
    async fn begin_transaction(&mut self, isolation_level: IsolationLevel) -> Result<Transaction>;

    async fn commit_transaction(&mut self, transaction: Transaction) -> Result<()>;

    async fn rollback_transaction(&mut self, transaction: Transaction) -> Result<()>;

    /// Close the connection if open and release it; idempotent
    async fn dispose(&mut self);
}

// =============================================================================
// Row cursor
// =============================================================================

/// Forward-only cursor over the rows of a query
///
/// Borrows the context until dropped.
pub struct RowCursor<'c> {
    rows: BoxStream<'c, std::result::Result<SqliteRow, sqlx::Error>>,
    timeout: Option<Duration>,
}

impl<'c> RowCursor<'c> {
    /// Advance to the next row
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        let next = self.rows.try_next();
        let row = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| DataError::Timeout(limit))??,
            None => next.await?,
        };
        Ok(row.map(Record::new))
    }

    /// Drain the remaining rows
    pub async fn collect_records(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record().await? {
            records.push(record);
        }
        Ok(records)
    }
}

// =============================================================================
// Joined rows
// =============================================================================

enum JoinedSource<'c, R> {
    Buffered(std::vec::IntoIter<R>),
    Streaming(BoxStream<'c, Result<R>>),
}

/// Mapped rows of a joined query
///
/// Buffered results are already in memory. Streaming results hold the
/// context's connection until dropped.
pub struct JoinedRows<'c, R> {
    rows: JoinedSource<'c, R>,
    timeout: Option<Duration>,
}

impl<'c, R> JoinedRows<'c, R> {
    pub fn is_buffered(&self) -> bool {
        matches!(self.rows, JoinedSource::Buffered(_))
    }

    /// Next mapped row, reading it from the database if streaming
    pub async fn next_row(&mut self) -> Result<Option<R>> {
        match &mut self.rows {
            JoinedSource::Buffered(rows) => Ok(rows.next()),
            JoinedSource::Streaming(rows) => {
                let next = rows.try_next();
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, next)
                        .await
                        .map_err(|_| DataError::Timeout(limit))?,
                    None => next.await,
                }
            }
        }
    }

    /// Drain the remaining rows
    pub async fn collect_rows(mut self) -> Result<Vec<R>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

impl<R> std::fmt::Debug for JoinedRows<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedRows")
            .field("buffered", &self.is_buffered())
            .finish()
    }
}

// =============================================================================
// SQLite context
// =============================================================================

/// Command pieces after validation against the context state
struct Prepared<'q> {
    sql: &'q str,
    arguments: SqliteArguments<'q>,
    split_on: &'q str,
}

/// SQLite-backed data context
pub struct SqliteContext {
    handle: ConnectionHandle,
    options: Arc<ClientOptions>,
    active_transaction: Option<Transaction>,
}

impl SqliteContext {
    /// Create a context; the connection is opened on first use
    ///
    /// # Errors
    /// `Config` if the options are invalid or the connection string cannot be parsed
    pub fn new(options: Arc<ClientOptions>) -> Result<Self> {
        options.validate()?;
        let connect_options = SqliteConnectOptions::from_str(&options.connection_string)?;

        Ok(Self {
            handle: ConnectionHandle::new(connect_options),
            options,
            active_transaction: None,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.status() == ConnectionStatus::Disposed
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DataError::Disposed);
        }
        Ok(())
    }

    /// Validate the command against the current state and build its arguments
    fn prepare<'q>(&mut self, cmd: Command<'q>) -> Result<Prepared<'q>> {
        self.ensure_not_disposed()?;

        let Command {
            sql,
            params,
            transaction,
            command_type,
            split_on,
        } = cmd;

        if command_type == CommandType::StoredProcedure {
            return Err(DataError::Unsupported(
                "SQLite has no stored procedures".to_string(),
            ));
        }

        self.check_transaction(transaction)?;

        Ok(Prepared {
            sql,
            arguments: Command::arguments(params),
            split_on,
        })
    }

    fn check_transaction(&mut self, supplied: Option<Transaction>) -> Result<()> {
        // A closed connection took its transaction with it
        if !self.handle.is_open() {
            self.active_transaction = None;
        }

        match (self.active_transaction, supplied) {
            (None, None) => Ok(()),
            (Some(active), Some(supplied)) if active == supplied => Ok(()),
            (Some(_), None) => Err(DataError::Transaction(
                "the context has an active transaction; pass it to the command".to_string(),
            )),
            (_, Some(_)) => Err(DataError::Transaction(
                "the transaction is not active on this context".to_string(),
            )),
        }
    }

    async fn finish_transaction(&mut self, transaction: Transaction, commit: bool) -> Result<()> {
        self.ensure_not_disposed()?;
        self.check_transaction(Some(transaction))?;

        let (operation, statement) = if commit {
            ("commit_transaction", "COMMIT")
        } else {
            ("rollback_transaction", "ROLLBACK")
        };
        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        let outcome = timed(operation, timeout, async move {
            let connection = handle.open().await?;
            sqlx::query(statement).execute(connection).await?;
            Ok(())
        })
        .await;

        match &outcome {
            Ok(()) => self.active_transaction = None,
            // A failed COMMIT leaves the transaction open so the caller can roll back
            Err(error) if commit && !matches!(error, DataError::Timeout(_)) => {}
            Err(_) => self.abandon_connection(operation),
        }

        if outcome.is_ok() && transaction.isolation_level() == IsolationLevel::ReadUncommitted {
            self.reset_read_uncommitted().await;
        }

        tracing::debug!(
            transaction_id = transaction.id,
            statement,
            success = outcome.is_ok(),
            "Transaction finished"
        );
        outcome
    }

    /// Drop a connection whose transaction state can no longer be trusted
    ///
    /// Any transaction the server still holds for it is rolled back when
    /// the connection goes away. The next command opens a fresh one.
    fn abandon_connection(&mut self, operation: &'static str) {
        self.active_transaction = None;
        self.handle.discard();
        tracing::warn!(operation, "Connection discarded after unfinished transaction command");
    }

    /// Turn dirty reads back off on a connection that had them enabled
    ///
    /// The connection is discarded if the pragma cannot be applied.
    async fn reset_read_uncommitted(&mut self) {
        if !self.handle.is_open() {
            return;
        }

        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;
        let reset = timed("reset_read_uncommitted", timeout, async move {
            let connection = handle.open().await?;
            sqlx::query("PRAGMA read_uncommitted = 0")
                .execute(connection)
                .await?;
            Ok(())
        })
        .await;

        if reset.is_err() {
            self.handle.discard();
        }
    }
}

/// Run a command future under the configured timeout and record its metrics
pub(super) async fn timed<T, F>(operation: &'static str, timeout: Option<Duration>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .unwrap_or_else(|_| Err(DataError::Timeout(limit))),
        None => future.await,
    };

    metrics::observe_query(operation, outcome.is_ok(), started.elapsed());
    if let Err(error) = &outcome {
        tracing::debug!(operation, %error, "Command failed");
    }

    outcome
}

fn map_joined<P: SplitRow>(row: &SqliteRow, split_on: &str) -> Result<P> {
    let segments = row_segments(row, split_on, P::ARITY)?;
    P::from_segments(row, &segments)
}

#[async_trait]
impl DataContext for SqliteContext {
    async fn execute_reader<'c>(&'c mut self, cmd: Command<'c>) -> Result<RowCursor<'c>> {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();

        let connection = timed("execute_reader", timeout, self.handle.open()).await?;
        let rows = sqlx::query_with(prepared.sql, prepared.arguments).fetch(connection);

        Ok(RowCursor { rows, timeout })
    }

    async fn get_connection(&mut self) -> Result<&mut ConnectionHandle> {
        let timeout = self.options.command_timeout();
        timed("get_connection", timeout, self.handle.open()).await?;
        Ok(&mut self.handle)
    }

    async fn get_many<T>(&mut self, cmd: Command<'_>) -> Result<Vec<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        timed("get_many", timeout, async move {
            let connection = handle.open().await?;
            Ok(
                sqlx::query_as_with::<_, T, _>(prepared.sql, prepared.arguments)
                    .fetch_all(connection)
                    .await?,
            )
        })
        .await
    }

    async fn get_many_joined<'c, P, R, F>(
        &'c mut self,
        cmd: Command<'c>,
        mut map: F,
    ) -> Result<JoinedRows<'c, R>>
    where
        P: SplitRow + Send + 'c,
        R: Send + 'c,
        F: FnMut(P) -> R + Send + 'c,
    {
        let Prepared {
            sql,
            arguments,
            split_on,
        } = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();

        if self.options.buffered {
            let handle = &mut self.handle;
            let mapped = timed("get_many_joined", timeout, async move {
                let connection = handle.open().await?;
                let rows = sqlx::query_with(sql, arguments).fetch_all(connection).await?;
                rows.iter()
                    .map(|row| map_joined::<P>(row, split_on).map(&mut map))
                    .collect::<Result<Vec<R>>>()
            })
            .await?;

            return Ok(JoinedRows {
                rows: JoinedSource::Buffered(mapped.into_iter()),
                timeout,
            });
        }

        let connection = timed("get_many_joined", timeout, self.handle.open()).await?;
        let rows = sqlx::query_with(sql, arguments)
            .fetch(connection)
            .map(move |row| -> Result<R> { Ok(map(map_joined::<P>(&row?, split_on)?)) })
            .boxed();

        Ok(JoinedRows {
            rows: JoinedSource::Streaming(rows),
            timeout,
        })
    }

    async fn get_one<T>(&mut self, cmd: Command<'_>) -> Result<Option<T>>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        timed("get_one", timeout, async move {
            let connection = handle.open().await?;
            Ok(
                sqlx::query_as_with::<_, T, _>(prepared.sql, prepared.arguments)
                    .fetch_optional(connection)
                    .await?,
            )
        })
        .await
    }

    async fn get_one_joined<P, R, F>(&mut self, cmd: Command<'_>, map: F) -> Result<Option<R>>
    where
        P: SplitRow + Send,
        R: Send,
        F: FnOnce(P) -> R + Send,
    {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();
        let buffered = self.options.buffered;
        let handle = &mut self.handle;

        timed("get_one_joined", timeout, async move {
            let connection = handle.open().await?;
            let query = sqlx::query_with(prepared.sql, prepared.arguments);

            let first = if buffered {
                query.fetch_all(connection).await?.into_iter().next()
            } else {
                query.fetch(connection).try_next().await?
            };

            match first {
                Some(row) => Ok(Some(map(map_joined::<P>(&row, prepared.split_on)?))),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_scalar<T>(&mut self, cmd: Command<'_>) -> Result<Option<T>>
    where
        T: Send + Unpin,
        (T,): for<'r> FromRow<'r, SqliteRow>,
    {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        timed("get_scalar", timeout, async move {
            let connection = handle.open().await?;
            Ok(
                sqlx::query_scalar_with::<_, T, _>(prepared.sql, prepared.arguments)
                    .fetch_optional(connection)
                    .await?,
            )
        })
        .await
    }

    async fn execute(&mut self, cmd: Command<'_>) -> Result<u64> {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        timed("execute", timeout, async move {
            let connection = handle.open().await?;
            let result = sqlx::query_with(prepared.sql, prepared.arguments)
                .execute(connection)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn execute_returning<T>(&mut self, cmd: Command<'_>) -> Result<T>
    where
        T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let prepared = self.prepare(cmd)?;
        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        timed("execute_returning", timeout, async move {
            let connection = handle.open().await?;
            let mut rows =
                sqlx::query_as_with::<_, T, _>(prepared.sql, prepared.arguments).fetch(connection);

            let single = rows.try_next().await?.ok_or(DataError::NoRows)?;
            if rows.try_next().await?.is_some() {
                return Err(DataError::MultipleRows);
            }
            Ok(single)
        })
        .await
    }

    async fn begin_transaction(&mut self, isolation_level: IsolationLevel) -> Result<Transaction> {
        self.ensure_not_disposed()?;
        self.check_transaction(None).map_err(|_| {
            DataError::Transaction(
                "a transaction is already active on this context".to_string(),
            )
        })?;

        let timeout = self.options.command_timeout();
        let handle = &mut self.handle;

        let outcome = timed("begin_transaction", timeout, async move {
            let connection = handle.open().await?;
            if isolation_level == IsolationLevel::ReadUncommitted {
                sqlx::query("PRAGMA read_uncommitted = 1")
                    .execute(&mut *connection)
                    .await?;
            }
            sqlx::query(isolation_level.begin_statement())
                .execute(&mut *connection)
                .await?;
            Ok(())
        })
        .await;

        if let Err(error) = outcome {
            // BEGIN may still land after a timeout; never keep that connection
            if matches!(error, DataError::Timeout(_)) {
                self.abandon_connection("begin_transaction");
            } else if isolation_level == IsolationLevel::ReadUncommitted {
                self.reset_read_uncommitted().await;
            }
            return Err(error);
        }

        let transaction = Transaction::start(isolation_level);
        self.active_transaction = Some(transaction);

        tracing::debug!(
            transaction_id = transaction.id,
            ?isolation_level,
            "Transaction started"
        );
        Ok(transaction)
    }

    async fn commit_transaction(&mut self, transaction: Transaction) -> Result<()> {
        self.finish_transaction(transaction, true).await
    }

    async fn rollback_transaction(&mut self, transaction: Transaction) -> Result<()> {
        self.finish_transaction(transaction, false).await
    }

    async fn dispose(&mut self) {
        self.active_transaction = None;
        self.handle.dispose().await;
    }
}

impl std::fmt::Debug for SqliteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteContext")
            .field("status", &self.handle.status())
            .field("active_transaction", &self.active_transaction)
            .finish()
    }
}
