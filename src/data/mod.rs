//! Data layer module
//!
//! Handles all data access and caching:
//! - Entity cache (volatile, per-entry expiration)
//! - Data contexts over a single SQLite connection
//! - Row mapping, including rows split across several types

mod cache;
mod command;
mod connection;
mod context;
mod factory;
mod record;

pub use cache::{CacheKey, EntityCache, MemoryCache};
pub use command::{Command, CommandType, DEFAULT_SPLIT_ON, IsolationLevel, SqlParam, Transaction};
pub use connection::{ConnectionHandle, ConnectionStatus};
pub use context::{DataContext, JoinedRows, RowCursor, SqliteContext};
pub use factory::{ContextFactory, SqliteContextFactory};
pub use record::{FromRecord, Record, RecordView, SplitRow};
