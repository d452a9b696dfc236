//! Access token refresh
//!
//! `POST {base}/api/auth/refresh` with `{"refreshToken": "..."}` and expects
//! `{"data": {"accessToken": "..."}}` back. The call authenticates with the
//! refresh token in its body, so it is sent on the raw client and never carries
//! an Authorization header.

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    data: RefreshData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: String,
}

/// Exchange a refresh token for a new access token.
///
/// Any outcome other than a 2xx with a non-empty `data.accessToken` is an
/// error. 401/403 map to `InvalidCredentials` (the refresh token itself was
/// rejected); other statuses and malformed bodies map to `Refresh`.
///
/// `timeout` bounds the whole call when set; `None` leaves it unbounded.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    url: &str,
    refresh: &str,
    timeout: Option<Duration>,
) -> Result<Secret<String>> {
    let mut request = client.post(url).json(&RefreshRequest {
        refresh_token: refresh,
    });
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh endpoint returned {status}: {body}"
            )));
        }

        return Err(Error::Refresh(format!(
            "refresh endpoint returned {status}: {body}"
        )));
    }

    let body = response
        .json::<RefreshResponse>()
        .await
        .map_err(|e| Error::Refresh(format!("invalid refresh response: {e}")))?;

    if body.data.access_token.is_empty() {
        return Err(Error::Refresh(
            "refresh response carried an empty accessToken".into(),
        ));
    }

    debug!("access token refreshed");
    Ok(Secret::new(body.data.access_token))
}
