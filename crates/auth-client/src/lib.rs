//! Authenticated HTTP client for the farm app backend
//!
//! Wraps `reqwest` with transparent access token refresh. Callers issue
//! requests as if credentials never expire; the client attaches the stored
//! access token, and when the backend answers 401 it refreshes once on behalf
//! of every request that hit the same expiry, then replays them.
//!
//! Request lifecycle:
//! 1. `augment` attaches `Authorization: Bearer <access>` when a token is stored
//! 2. Backend returns 401 → `coordinator` claims the refresh or queues behind it
//! 3. Refresh succeeds → new access token persisted, queued requests replayed
//! 4. Refresh impossible or failed → `teardown` clears the session and redirects
//!    to the entry route; every waiting request gets the error

pub mod augment;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod teardown;

pub use client::AuthClient;
pub use config::ClientConfig;
pub use coordinator::{HttpRefresher, Phase, RefreshCoordinator, Refresher};
pub use error::{Error, Result};
pub use queue::{FailedRequestQueue, RefreshOutcome, Waiter};
pub use teardown::{LogNavigator, Navigator, SessionTeardown};
