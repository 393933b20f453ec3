//! Data context construction
//!
//! Contexts are created per unit of work. The factory resolves the client
//! options either once (static) or on every creation (scoped), so a
//! caller can vary the connection per request or tenant.

use std::fmt;
use std::sync::Arc;

use super::context::{DataContext, SqliteContext};
use crate::config::ClientOptions;
use crate::error::Result;

/// Creates a fresh, unopened data context per unit of work
pub trait ContextFactory: Send + Sync + 'static {
    type Context: DataContext + 'static;

    fn create(&self) -> Result<Self::Context>;
}

type ResolveOptions = dyn Fn() -> Result<ClientOptions> + Send + Sync;

/// Where a factory gets its client options from
#[derive(Clone)]
enum OptionsSource {
    /// Same options for every context
    Static(Arc<ClientOptions>),
    /// Resolved again for every context
    Scoped(Arc<ResolveOptions>),
}

impl fmt::Debug for OptionsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsSource::Static(options) => f.debug_tuple("Static").field(options).finish(),
            OptionsSource::Scoped(_) => f.write_str("Scoped(..)"),
        }
    }
}

/// Factory for [`SqliteContext`]
#[derive(Debug, Clone)]
pub struct SqliteContextFactory {
    source: OptionsSource,
}

impl SqliteContextFactory {
    /// Every context uses the same options
    pub fn new(options: ClientOptions) -> Self {
        Self {
            source: OptionsSource::Static(Arc::new(options)),
        }
    }

    /// Options are resolved by `resolve` each time a context is created
    pub fn scoped<F>(resolve: F) -> Self
    where
        F: Fn() -> Result<ClientOptions> + Send + Sync + 'static,
    {
        Self {
            source: OptionsSource::Scoped(Arc::new(resolve)),
        }
    }

    /// Options the next context will be created with
    pub fn options(&self) -> Result<Arc<ClientOptions>> {
        match &self.source {
            OptionsSource::Static(options) => Ok(Arc::clone(options)),
            OptionsSource::Scoped(resolve) => Ok(Arc::new(resolve()?)),
        }
    }
}

impl ContextFactory for SqliteContextFactory {
    type Context = SqliteContext;

    fn create(&self) -> Result<SqliteContext> {
        SqliteContext::new(self.options()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ConnectionStatus;
    use crate::error::DataError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_static_factory_shares_options() {
        let factory = SqliteContextFactory::new(ClientOptions::new("sqlite::memory:"));

        let first = factory.options().unwrap();
        let second = factory.options().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let ctx = factory.create().unwrap();
        assert_eq!(ctx.status(), ConnectionStatus::Closed);
        assert_eq!(ctx.options().connection_string, "sqlite::memory:");
    }

    #[test]
    fn test_scoped_factory_resolves_per_context() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = SqliteContextFactory::scoped(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            Ok(ClientOptions::new("sqlite::memory:").with_command_timeout(call as u64 + 1))
        });

        let first = factory.create().unwrap();
        let second = factory.create().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.options().command_timeout, Some(1));
        assert_eq!(second.options().command_timeout, Some(2));
    }

    #[test]
    fn test_scoped_resolution_error_is_returned() {
        let factory = SqliteContextFactory::scoped(|| {
            Err(DataError::Config("tenant not found".to_string()))
        });

        assert!(matches!(factory.create(), Err(DataError::Config(_))));
    }

    #[test]
    fn test_invalid_options_rejected_at_creation() {
        let factory =
            SqliteContextFactory::new(ClientOptions::new("sqlite::memory:").with_command_timeout(0));

        assert!(matches!(factory.create(), Err(DataError::Config(_))));
    }
}
