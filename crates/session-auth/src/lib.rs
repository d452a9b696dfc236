//! Session credentials for the farm app backend
//!
//! Holds everything the authenticated client needs to know about the signed-in
//! user without owning any control flow:
//! - `credentials`: the `CredentialStore` trait over a flat, string-keyed
//!   durable store, with file-backed and in-memory implementations
//! - `session`: the credential pair and the cached profile fields stored
//!   alongside it
//! - `token`: the dedicated refresh call against `/api/auth/refresh`
//!
//! Issuing credentials (login) is someone else's job; this crate only reads,
//! replaces, and clears what a login flow left behind.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod session;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StorageKey};
pub use error::{Error, Result};
pub use session::{CredentialPair, Session, SessionMetadata};
pub use token::refresh_access_token;
