//! Session endpoints
//!
//! - GET    /session: signed-in state and cached profile, never tokens
//! - PUT    /session: install a session handed over by a login flow
//! - DELETE /session: explicit logout

use std::sync::Arc;

use auth_client::AuthClient;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use session_auth::{CredentialPair, Session, SessionMetadata};
use tracing::{error, info};

/// Body accepted by `PUT /session`: the token pair plus any profile fields,
/// keyed the way the backend's login response names them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(flatten)]
    pub profile: SessionMetadata,
}

impl SessionPayload {
    fn into_session(self) -> Option<Session> {
        let access = self.access_token.filter(|t| !t.is_empty())?;
        let refresh = self.refresh_token.filter(|t| !t.is_empty())?;
        Some(Session {
            credentials: CredentialPair::new(access, refresh),
            metadata: self.profile,
        })
    }
}

pub fn build_session_router(client: Arc<AuthClient>) -> Router {
    Router::new()
        .route(
            "/session",
            get(get_session).put(put_session).delete(delete_session),
        )
        .with_state(client)
}

fn json_error(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": { "type": kind, "message": message } })),
    )
        .into_response()
}

async fn get_session(State(client): State<Arc<AuthClient>>) -> Response {
    match client.session().await {
        Ok(session) => Json(serde_json::json!({
            "authenticated": session.is_authenticated(),
            "refreshing": client.coordinator().is_refreshing(),
            "profile": session.metadata,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "failed to read session");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "gateway_error", &e.to_string())
        }
    }
}

async fn put_session(
    State(client): State<Arc<AuthClient>>,
    Json(payload): Json<SessionPayload>,
) -> Response {
    let Some(session) = payload.into_session() else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "accessToken and refreshToken are both required",
        );
    };

    match client.sign_in(&session).await {
        Ok(()) => {
            info!(
                user_id = session.metadata.user_id.as_deref().unwrap_or(""),
                "session installed"
            );
            Json(serde_json::json!({ "authenticated": true })).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to persist session");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "gateway_error", &e.to_string())
        }
    }
}

async fn delete_session(State(client): State<Arc<AuthClient>>) -> impl IntoResponse {
    client.logout().await;
    Json(serde_json::json!({ "redirect": client.config().entry_route }))
}
