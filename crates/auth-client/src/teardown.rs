//! Forced logout
//!
//! Clears every persisted session key and sends the app back to its
//! unauthenticated entry route. Runs when a refresh is impossible or fails, and
//! on explicit logout.

use std::sync::Arc;

use session_auth::CredentialStore;
use tracing::{info, warn};

use crate::metrics;

/// Whatever owns navigation for the embedding app.
pub trait Navigator: Send + Sync {
    /// Send the user to `route`.
    fn redirect(&self, route: &str);
}

/// Navigator for headless embeddings: the redirect is only logged.
#[derive(Debug, Default)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect(&self, route: &str) {
        info!(route, "session ended, redirecting to entry route");
    }
}

/// Clears the session and redirects. Idempotent.
pub struct SessionTeardown {
    store: Arc<dyn CredentialStore>,
    navigator: Arc<dyn Navigator>,
    entry_route: String,
}

impl SessionTeardown {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        entry_route: impl Into<String>,
    ) -> Self {
        Self {
            store,
            navigator,
            entry_route: entry_route.into(),
        }
    }

    pub fn entry_route(&self) -> &str {
        &self.entry_route
    }

    /// Clear credentials and profile fields, then redirect.
    ///
    /// A store failure is logged; the redirect happens regardless.
    pub async fn run(&self) {
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear stored session during teardown");
        }
        metrics::record_teardown();
        self.navigator.redirect(&self.entry_route);
    }
}
