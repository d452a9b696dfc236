//! Backend forwarding through the authenticated client
//!
//! Receives inbound requests, strips hop-by-hop and credential headers, and
//! sends them to the backend via `AuthClient`, which attaches the session's
//! access token and recovers from expiry. Backend responses are relayed
//! verbatim. Failures that ended the session become a `session_expired` 401
//! that points the caller back at the entry route.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use auth_client::{AuthClient, Error as ClientError};
use axum::http::StatusCode;
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION};
use axum::response::{IntoResponse, Response};
use tracing::{error, instrument, warn};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub client: Arc<AuthClient>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// 401 telling the caller the session is gone and where to go next.
fn session_expired_response(message: &str, redirect: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "session_expired",
            "message": message,
            "request_id": request_id,
            "redirect": redirect,
        }
    });
    (
        StatusCode::UNAUTHORIZED,
        [
            (CONTENT_TYPE, "application/json".to_string()),
            (LOCATION, redirect.to_string()),
        ],
        body.to_string(),
    )
        .into_response()
}

/// Forward an inbound request to the backend.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if forwardable(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    let mut builder = state.client.request(method, &path).headers(headers);

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };
    if !body_bytes.is_empty() {
        builder = builder.body(body_bytes);
    }

    let signed_in = state.client.is_authenticated().await.unwrap_or(false);
    match state.client.send(builder).await {
        Ok(backend_response) => relay(state, backend_response, &request_id).await,
        Err(err) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            failure_response(&state.client, err, signed_in, &request_id).await
        }
    }
}

async fn relay(state: &ProxyState, backend_response: reqwest::Response, request_id: &str) -> Response {
    let status = backend_response.status();
    let resp_headers = backend_response.headers().clone();

    let resp_body = match backend_response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read backend response body");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &format!("backend response read error: {e}"),
                request_id,
            );
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &resp_headers {
        if !is_hop_by_hop(name.as_str()) && name != CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(resp_body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Map a client failure onto the response the caller sees.
///
/// Whether the session ended is read back from the store, whatever the error:
/// teardown has already run by the time a refresh failure reaches us. A
/// request that went out anonymously only ends a session on a 401.
async fn failure_response(
    client: &AuthClient,
    err: ClientError,
    signed_in: bool,
    request_id: &str,
) -> Response {
    let session_ended = (signed_in || err.is_unauthorized())
        && !client.is_authenticated().await.unwrap_or(false);
    if session_ended {
        warn!(error = %err, "session ended while forwarding request");
        return session_expired_response(
            &err.to_string(),
            &client.config().entry_route,
            request_id,
        );
    }

    match err {
        ClientError::Status { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, body).into_response()
        }
        ClientError::Http(msg) => {
            error!(error = %msg, "backend request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &format!("backend error: {msg}"),
                request_id,
            )
        }
        ClientError::RefreshTimeout(_) => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "refresh_timeout",
            &err.to_string(),
            request_id,
        ),
        ClientError::RefreshAborted
        | ClientError::RefreshFailed(_)
        | ClientError::RefreshRejected(_)
        | ClientError::SessionExpired(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "refresh_error",
            &err.to_string(),
            request_id,
        ),
        ClientError::InvalidRequest(msg) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &msg, request_id)
        }
        ClientError::Credential(_) | ClientError::Config(_) => {
            error!(error = %err, "gateway misconfigured or session store unavailable");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gateway_error",
                &err.to_string(),
                request_id,
            )
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Inbound headers that reach the backend. Credentials always come from the
/// session, never from the caller.
fn forwardable(name: &str) -> bool {
    !is_hop_by_hop(name)
        && !name.eq_ignore_ascii_case(HOST.as_str())
        && !name.eq_ignore_ascii_case(AUTHORIZATION.as_str())
        && !name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str())
}
