//! Command description
//!
//! A `Command` bundles everything a context needs to run one statement:
//! SQL text, positional parameters, the transaction it belongs to, the
//! statement kind and the split column used by joined mappings.

use chrono::{DateTime, Utc};
use sqlx::Arguments;
use sqlx::sqlite::SqliteArguments;
use std::sync::atomic::{AtomicU64, Ordering};

/// Column name that marks where the next type starts in a joined row
pub const DEFAULT_SPLIT_ON: &str = "Id";

/// Positional SQL parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        SqlParam::Bool(value)
    }
}

impl From<i32> for SqlParam {
    fn from(value: i32) -> Self {
        SqlParam::Int(value.into())
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        SqlParam::Real(value)
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(value: Vec<u8>) -> Self {
        SqlParam::Blob(value)
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(value: DateTime<Utc>) -> Self {
        SqlParam::Timestamp(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlParam::Null, Into::into)
    }
}

/// Statement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandType {
    /// Raw SQL text
    #[default]
    Text,
    /// Name of a stored procedure
    StoredProcedure,
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    /// SQLite statement that opens a transaction at this level
    pub(crate) fn begin_statement(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        }
    }
}

/// Source of transaction ids, unique for the lifetime of the process
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for a transaction started on a data context
///
/// Pass it to every command that runs inside the transaction, then
/// finish it with `commit_transaction` or `rollback_transaction` on the
/// same context. Two handles compare equal only if they are copies of
/// the same `begin_transaction` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub(crate) id: u64,
    isolation_level: IsolationLevel,
}

impl Transaction {
    /// Allocate a handle with a fresh id
    pub(crate) fn start(isolation_level: IsolationLevel) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            isolation_level,
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }
}

/// One statement to run on a data context
///
/// # Example
/// ```ignore
/// let cmd = Command::new("SELECT * FROM users WHERE name = ?").bind("alice");
/// let users: Vec<User> = ctx.get_many(cmd).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Command<'a> {
    pub(crate) sql: &'a str,
    pub(crate) params: Vec<SqlParam>,
    pub(crate) transaction: Option<Transaction>,
    pub(crate) command_type: CommandType,
    pub(crate) split_on: &'a str,
}

impl<'a> Command<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            params: Vec::new(),
            transaction: None,
            command_type: CommandType::Text,
            split_on: DEFAULT_SPLIT_ON,
        }
    }

    /// Append a positional parameter
    pub fn bind(mut self, value: impl Into<SqlParam>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Run inside the given transaction
    pub fn in_transaction(mut self, transaction: &Transaction) -> Self {
        self.transaction = Some(*transaction);
        self
    }

    pub fn command_type(mut self, command_type: CommandType) -> Self {
        self.command_type = command_type;
        self
    }

    /// Column marking the boundary between joined types (default: "Id")
    pub fn split_on(mut self, column: &'a str) -> Self {
        self.split_on = column;
        self
    }

    pub fn sql(&self) -> &str {
        self.sql
    }

    pub(crate) fn arguments(params: Vec<SqlParam>) -> SqliteArguments<'a> {
        let mut arguments = SqliteArguments::default();
        for param in params {
            match param {
                SqlParam::Null => arguments.add(Option::<i64>::None),
                SqlParam::Bool(value) => arguments.add(value),
                SqlParam::Int(value) => arguments.add(value),
                SqlParam::Real(value) => arguments.add(value),
                SqlParam::Text(value) => arguments.add(value),
                SqlParam::Blob(value) => arguments.add(value),
                SqlParam::Timestamp(value) => arguments.add(value),
            }
        }
        arguments
    }
}

impl<'a> From<&'a str> for Command<'a> {
    fn from(sql: &'a str) -> Self {
        Command::new(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_defaults() {
        let cmd = Command::new("SELECT 1");
        assert_eq!(cmd.sql(), "SELECT 1");
        assert_eq!(cmd.split_on, DEFAULT_SPLIT_ON);
        assert_eq!(cmd.command_type, CommandType::Text);
        assert!(cmd.transaction.is_none());
        assert!(cmd.params.is_empty());
    }

    #[test]
    fn bind_converts_values() {
        let cmd = Command::new("INSERT INTO t VALUES (?, ?, ?, ?)")
            .bind(1)
            .bind("name")
            .bind(Option::<String>::None)
            .bind(true);

        assert_eq!(
            cmd.params,
            vec![
                SqlParam::Int(1),
                SqlParam::Text("name".to_string()),
                SqlParam::Null,
                SqlParam::Bool(true),
            ]
        );
    }

    #[test]
    fn transaction_ids_are_never_reused() {
        let first = Transaction::start(IsolationLevel::Unspecified);
        let second = Transaction::start(IsolationLevel::Unspecified);

        assert_ne!(first, second);
        assert_eq!(first, first.clone());
    }

    #[test]
    fn serializable_takes_write_lock_up_front() {
        assert_eq!(
            IsolationLevel::Serializable.begin_statement(),
            "BEGIN IMMEDIATE"
        );
        assert_eq!(
            IsolationLevel::ReadCommitted.begin_statement(),
            "BEGIN DEFERRED"
        );
    }
}
