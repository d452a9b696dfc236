//! Backend auth contract constants
//!
//! Paths and header formats shared by the refresh call and the request
//! augmenter. Storage key names live on `StorageKey`.

/// Credential refresh endpoint, relative to the backend base URL
pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// Scheme prefix for the Authorization header
pub const BEARER_PREFIX: &str = "Bearer ";

/// Unauthenticated entry route the app falls back to after a forced logout
pub const DEFAULT_ENTRY_ROUTE: &str = "/";
