//! Connection handle
//!
//! Wraps one physical SQLite connection behind an explicit state machine:
//!
//! ```text
//! Closed ──open──▶ Open ──close──▶ Closed
//!    │               │
//!    └────dispose────┴──────────▶ Disposed (terminal)
//! ```

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};

use crate::error::{DataError, Result};
use crate::metrics::DB_CONNECTIONS_ACTIVE;

/// Connection lifecycle state
enum ConnectionState {
    Closed,
    Open(SqliteConnection),
    Disposed,
}

/// Observable state without the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Open,
    Disposed,
}

/// Handle over a single SQLite connection
pub struct ConnectionHandle {
    options: SqliteConnectOptions,
    state: ConnectionState,
}

impl ConnectionHandle {
    /// Create a closed handle; nothing is opened until first use
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self {
            options,
            state: ConnectionState::Closed,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.state {
            ConnectionState::Closed => ConnectionStatus::Closed,
            ConnectionState::Open(_) => ConnectionStatus::Open,
            ConnectionState::Disposed => ConnectionStatus::Disposed,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open(_))
    }

    /// Open the connection if it is closed and return it
    ///
    /// Opening an already open connection is a no-op.
    ///
    /// # Errors
    /// `Disposed` after disposal, `Connectivity` if the database cannot be opened
    pub async fn open(&mut self) -> Result<&mut SqliteConnection> {
        match self.state {
            ConnectionState::Disposed => return Err(DataError::Disposed),
            ConnectionState::Closed => {
                let connection = self.options.connect().await?;
                self.state = ConnectionState::Open(connection);
                DB_CONNECTIONS_ACTIVE.inc();
                tracing::debug!("Connection opened");
            }
            ConnectionState::Open(_) => {}
        }

        match &mut self.state {
            ConnectionState::Open(connection) => Ok(connection),
            _ => Err(DataError::Disposed),
        }
    }

    /// Close the connection; closing a closed connection is a no-op
    ///
    /// # Errors
    /// `Disposed` after disposal, `Connectivity` if the close handshake fails
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ConnectionState::Closed) {
            ConnectionState::Open(connection) => {
                DB_CONNECTIONS_ACTIVE.dec();
                connection.close().await?;
                tracing::debug!("Connection closed");
                Ok(())
            }
            ConnectionState::Closed => Ok(()),
            ConnectionState::Disposed => {
                self.state = ConnectionState::Disposed;
                Err(DataError::Disposed)
            }
        }
    }

    /// Drop the connection without the close handshake
    ///
    /// Used when a statement was abandoned mid-flight: SQLite rolls back
    /// whatever that connection left open once the handle goes away.
    pub(crate) fn discard(&mut self) {
        if let ConnectionState::Open(connection) =
            std::mem::replace(&mut self.state, ConnectionState::Closed)
        {
            DB_CONNECTIONS_ACTIVE.dec();
            drop(connection);
            tracing::debug!("Connection discarded");
        }
    }

    /// Close (if open) and release the connection
    ///
    /// Idempotent. A failing close is logged; the handle ends up disposed
    /// regardless.
    pub async fn dispose(&mut self) {
        if let ConnectionState::Open(connection) =
            std::mem::replace(&mut self.state, ConnectionState::Disposed)
        {
            DB_CONNECTIONS_ACTIVE.dec();
            if let Err(error) = connection.close().await {
                tracing::warn!(%error, "Failed to close connection during dispose");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // Dropping the sqlx connection shuts its worker down; only the gauge needs fixing.
        if self.is_open() {
            DB_CONNECTIONS_ACTIVE.dec();
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("status", &self.status())
            .finish()
    }
}
