//! Outgoing request augmentation
//!
//! Runs before every request leaves the client. Attaches the stored access
//! token as a bearer credential; with no token the request goes out anonymous.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use session_auth::{BEARER_PREFIX, CredentialStore, StorageKey};
use tracing::warn;

use crate::error::{Error, Result};

/// Attach `Authorization: Bearer <access>` when an access token is stored.
///
/// Never fails: an unreadable store or a token that isn't a valid header value
/// is logged and the request proceeds without credentials.
pub async fn apply_bearer(headers: &mut HeaderMap, store: &dyn CredentialStore) {
    let access = match store.get(StorageKey::AccessToken).await {
        Ok(Some(token)) if !token.is_empty() => token,
        Ok(_) => return,
        Err(e) => {
            warn!(error = %e, "could not read access token, sending request anonymously");
            return;
        }
    };

    if let Err(e) = set_bearer(headers, &access) {
        warn!(error = %e, "stored access token is not a valid header value, sending anonymously");
    }
}

/// Overwrite the Authorization header with the given token.
pub fn set_bearer(headers: &mut HeaderMap, token: &str) -> Result<()> {
    let mut value = HeaderValue::from_str(&format!("{BEARER_PREFIX}{token}"))
        .map_err(|e| Error::InvalidRequest(format!("invalid token value: {e}")))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}
