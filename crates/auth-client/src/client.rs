//! Authenticated HTTP client
//!
//! Every request goes through the same pipeline:
//! 1. attach the stored access token (anonymous when there is none)
//! 2. send
//! 3. on a first 401, hand off to the `RefreshCoordinator` and replay once
//!    with the token it returns
//!
//! A replayed request that is rejected again is not refreshed a second time.
//! Statuses other than 401 are returned to the caller untouched; the JSON
//! helpers turn them into `Error::Status`.

use std::sync::Arc;

use common::Secret;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use session_auth::{CredentialPair, CredentialStore, Session};
use tracing::{debug, warn};

use crate::augment::{apply_bearer, set_bearer};
use crate::config::ClientConfig;
use crate::coordinator::{HttpRefresher, RefreshCoordinator, Refresher};
use crate::error::{Error, Result};
use crate::teardown::{Navigator, SessionTeardown};

pub struct AuthClient {
    http: reqwest::Client,
    config: ClientConfig,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
}

impl AuthClient {
    /// Build a client that refreshes against the configured backend.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        let refresher = Arc::new(HttpRefresher::new(
            http.clone(),
            config.refresh_url(),
            config.refresh_timeout(),
        ));
        Ok(Self::with_refresher(config, http, store, navigator, refresher))
    }

    /// Build a client around an existing HTTP client and refresher.
    pub fn with_refresher(
        config: ClientConfig,
        http: reqwest::Client,
        store: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
        refresher: Arc<dyn Refresher>,
    ) -> Self {
        let teardown = Arc::new(SessionTeardown::new(
            store.clone(),
            navigator,
            config.entry_route.clone(),
        ));
        let coordinator =
            RefreshCoordinator::new(store.clone(), refresher, teardown, config.wait_timeout());
        Self {
            http,
            config,
            store,
            coordinator,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Start a request against a backend path with the client timeout applied.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.config.url(path))
            .timeout(self.config.timeout())
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder
            .build()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        self.execute(request).await
    }

    /// Run a request through augmentation and 401 recovery.
    ///
    /// Returns the backend response for any status except an unrecovered 401,
    /// which is an `Error::Status`. Refresh failures surface as the refresh
    /// error after the session has been torn down.
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<Response> {
        apply_bearer(request.headers_mut(), self.store.as_ref()).await;
        let replay = request.try_clone();

        let response = self.http.execute(request).await.map_err(transport_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let unauthorized = status_error(response).await;
        let token = self.coordinator.recover(unauthorized.clone()).await?;

        let Some(mut replay) = replay else {
            warn!("request body cannot be replayed, returning the original 401");
            return Err(unauthorized);
        };
        self.replay(&mut replay, &token)?;

        let response = self.http.execute(replay).await.map_err(transport_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("replayed request rejected again, not refreshing twice");
            return Err(status_error(response).await);
        }
        Ok(response)
    }

    fn replay(&self, request: &mut reqwest::Request, token: &Secret<String>) -> Result<()> {
        set_bearer(request.headers_mut(), token.expose())?;
        debug!(method = %request.method(), url = %request.url(), "replaying request with refreshed token");
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)).await?;
        read_json(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.request(Method::POST, path).json(body))
            .await?;
        read_json(response).await
    }

    /// Both tokens present. Says nothing about whether they are still valid.
    pub async fn is_authenticated(&self) -> Result<bool> {
        Ok(CredentialPair::load(self.store.as_ref())
            .await?
            .is_authenticated())
    }

    pub async fn session(&self) -> Result<Session> {
        Ok(Session::load(self.store.as_ref()).await?)
    }

    /// Persist a session handed over by a login flow.
    pub async fn sign_in(&self, session: &Session) -> Result<()> {
        Ok(session.save(self.store.as_ref()).await?)
    }

    /// Explicit logout: the same teardown a failed refresh runs.
    pub async fn logout(&self) {
        self.coordinator.teardown().run().await;
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Http(format!("request timed out: {e}"))
    } else {
        Error::Http(e.to_string())
    }
}

async fn status_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Error::Status { status, body }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| Error::Http(format!("invalid response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teardown::tests::RecordingNavigator;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::{Value, json};
    use session_auth::{MemoryCredentialStore, StorageKey};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    /// Mock farm backend. Protected routes accept only `valid_token`; the
    /// refresh endpoint answers with `refresh_status` after `refresh_delay`,
    /// optionally held until the test releases it.
    struct Backend {
        valid_token: &'static str,
        refresh_status: StatusCode,
        refresh_delay: Duration,
        gated: bool,
        gate: Semaphore,
        refresh_calls: AtomicUsize,
        refresh_bodies: Mutex<Vec<Value>>,
        seen_auth: Mutex<Vec<Option<String>>>,
    }

    impl Backend {
        fn new(valid_token: &'static str, refresh_status: StatusCode) -> Arc<Self> {
            Self::build(valid_token, refresh_status, false)
        }

        fn gated(valid_token: &'static str, refresh_status: StatusCode) -> Arc<Self> {
            Self::build(valid_token, refresh_status, true)
        }

        fn slow(valid_token: &'static str, refresh_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                refresh_delay,
                ..Self::fields(valid_token, StatusCode::OK, false)
            })
        }

        fn build(valid_token: &'static str, refresh_status: StatusCode, gated: bool) -> Arc<Self> {
            Arc::new(Self::fields(valid_token, refresh_status, gated))
        }

        fn fields(valid_token: &'static str, refresh_status: StatusCode, gated: bool) -> Self {
            Self {
                valid_token,
                refresh_status,
                refresh_delay: Duration::ZERO,
                gated,
                gate: Semaphore::new(0),
                refresh_calls: AtomicUsize::new(0),
                refresh_bodies: Mutex::new(Vec::new()),
                seen_auth: Mutex::new(Vec::new()),
            }
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        fn seen_auth(&self) -> Vec<Option<String>> {
            self.seen_auth.lock().unwrap().clone()
        }

        fn authorize(&self, headers: &HeaderMap) -> bool {
            let auth = headers
                .get("authorization")
                .map(|v| v.to_str().unwrap_or("").to_string());
            let ok = auth.as_deref() == Some(&format!("Bearer {}", self.valid_token)[..]);
            self.seen_auth.lock().unwrap().push(auth);
            ok
        }
    }

    async fn farms(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> axum::response::Response {
        if !backend.authorize(&headers) {
            return (StatusCode::UNAUTHORIZED, "token expired").into_response();
        }
        axum::Json(json!({ "data": [{ "name": "Green Acres" }] })).into_response()
    }

    async fn branding(
        State(backend): State<Arc<Backend>>,
        headers: HeaderMap,
        body: axum::Json<Value>,
    ) -> axum::response::Response {
        if !backend.authorize(&headers) {
            return (StatusCode::UNAUTHORIZED, "token expired").into_response();
        }
        axum::Json(json!({ "data": body.0 })).into_response()
    }

    async fn refresh(
        State(backend): State<Arc<Backend>>,
        body: axum::Json<Value>,
    ) -> axum::response::Response {
        backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
        backend.refresh_bodies.lock().unwrap().push(body.0);
        if backend.gated {
            backend.gate.acquire().await.unwrap().forget();
        }
        tokio::time::sleep(backend.refresh_delay).await;
        if backend.refresh_status.is_success() {
            axum::Json(json!({ "data": { "accessToken": "A2" } })).into_response()
        } else {
            (backend.refresh_status, "refresh exploded").into_response()
        }
    }

    async fn spawn_backend(backend: Arc<Backend>) -> String {
        let app = axum::Router::new()
            .route("/api/farms", get(farms))
            .route("/api/farms/branding", post(branding))
            .route("/api/auth/refresh", post(refresh))
            .with_state(backend);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn signed_in() -> Arc<MemoryCredentialStore> {
        Arc::new(MemoryCredentialStore::with_entries([
            (StorageKey::AccessToken, "A1"),
            (StorageKey::RefreshToken, "R1"),
            (StorageKey::FarmName, "Green Acres"),
        ]))
    }

    fn client(
        base_url: String,
        store: Arc<MemoryCredentialStore>,
    ) -> (Arc<AuthClient>, Arc<RecordingNavigator>) {
        client_with(ClientConfig::new(base_url), store)
    }

    fn client_with(
        config: ClientConfig,
        store: Arc<MemoryCredentialStore>,
    ) -> (Arc<AuthClient>, Arc<RecordingNavigator>) {
        let navigator = Arc::new(RecordingNavigator::default());
        let client = AuthClient::new(config, store, navigator.clone()).unwrap();
        (Arc::new(client), navigator)
    }

    async fn wait_for_queue(client: &AuthClient, expected: usize) {
        while client.coordinator().queued() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn_get(client: &Arc<AuthClient>) -> tokio::task::JoinHandle<Result<Value>> {
        let client = client.clone();
        tokio::spawn(async move { client.get_json::<Value>("/api/farms").await })
    }

    #[tokio::test]
    async fn concurrent_expiry_refreshes_once_and_replays_all() {
        let backend = Backend::gated("A2", StatusCode::OK);
        let store = signed_in();
        let (client, navigator) = client(spawn_backend(backend.clone()).await, store.clone());

        let handles: Vec<_> = (0..3).map(|_| spawn_get(&client)).collect();
        wait_for_queue(&client, 2).await;
        backend.gate.add_permits(1);

        for handle in handles {
            let body = handle.await.unwrap().unwrap();
            assert_eq!(body["data"][0]["name"], "Green Acres");
        }

        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(
            *backend.refresh_bodies.lock().unwrap(),
            vec![json!({ "refreshToken": "R1" })]
        );
        let seen = backend.seen_auth();
        assert_eq!(seen.len(), 6);
        assert_eq!(
            seen.iter()
                .filter(|a| a.as_deref() == Some("Bearer A2"))
                .count(),
            3,
            "every request is replayed with the new token: {seen:?}"
        );
        assert_eq!(
            store.get(StorageKey::AccessToken).await.unwrap().as_deref(),
            Some("A2")
        );
        assert_eq!(
            store.get(StorageKey::RefreshToken).await.unwrap().as_deref(),
            Some("R1")
        );
        assert!(navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn missing_refresh_token_logs_out_without_refreshing() {
        let backend = Backend::new("A2", StatusCode::OK);
        let store = Arc::new(MemoryCredentialStore::with_entries([
            (StorageKey::AccessToken, "A1"),
            (StorageKey::Email, "grower@example.com"),
        ]));
        let (client, navigator) = client(spawn_backend(backend.clone()).await, store.clone());

        let err = client.get_json::<Value>("/api/farms").await.unwrap_err();

        assert!(err.is_unauthorized(), "got {err:?}");
        assert_eq!(backend.refresh_calls(), 0);
        assert!(store.is_empty().await);
        assert_eq!(navigator.redirects(), vec!["/"]);
    }

    #[tokio::test]
    async fn refresh_failure_rejects_everyone_and_logs_out() {
        let backend = Backend::gated("A2", StatusCode::INTERNAL_SERVER_ERROR);
        let store = signed_in();
        let (client, navigator) = client(spawn_backend(backend.clone()).await, store.clone());

        let first = spawn_get(&client);
        let second = spawn_get(&client);
        wait_for_queue(&client, 1).await;
        backend.gate.add_permits(1);

        for handle in [first, second] {
            let err = handle.await.unwrap().unwrap_err();
            assert!(
                matches!(err, Error::RefreshFailed(ref m) if m.contains("500")),
                "got {err:?}"
            );
        }
        assert_eq!(backend.refresh_calls(), 1);
        assert!(store.is_empty().await);
        assert_eq!(navigator.redirects(), vec!["/"]);
        assert!(!client.coordinator().is_refreshing());
    }

    #[tokio::test]
    async fn rejected_refresh_token_rejects_everyone_and_logs_out() {
        let backend = Backend::gated("A2", StatusCode::FORBIDDEN);
        let store = signed_in();
        let (client, navigator) = client(spawn_backend(backend.clone()).await, store.clone());

        let first = spawn_get(&client);
        let second = spawn_get(&client);
        wait_for_queue(&client, 1).await;
        backend.gate.add_permits(1);

        for handle in [first, second] {
            let err = handle.await.unwrap().unwrap_err();
            assert!(
                matches!(err, Error::RefreshRejected(ref m) if m.contains("403")),
                "got {err:?}"
            );
        }
        assert_eq!(backend.refresh_calls(), 1);
        assert!(store.is_empty().await);
        assert_eq!(navigator.redirects(), vec!["/"]);
    }

    #[tokio::test]
    async fn refresh_call_timeout_is_a_refresh_failure() {
        let backend = Backend::slow("A2", Duration::from_secs(5));
        let store = signed_in();
        let mut config = ClientConfig::new(spawn_backend(backend.clone()).await);
        config.refresh_timeout_secs = Some(1);
        let (client, navigator) = client_with(config, store.clone());

        let owner = spawn_get(&client);
        while !client.coordinator().is_refreshing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let waiter = spawn_get(&client);
        wait_for_queue(&client, 1).await;

        for handle in [owner, waiter] {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::RefreshFailed(_)), "got {err:?}");
        }
        assert_eq!(backend.refresh_calls(), 1);
        assert!(store.is_empty().await, "teardown must clear the session");
        assert_eq!(navigator.redirects(), vec!["/"]);
        assert!(!client.coordinator().is_refreshing());
    }

    #[tokio::test]
    async fn replayed_401_is_not_refreshed_again() {
        let backend = Backend::new("never-valid", StatusCode::OK);
        let store = signed_in();
        let (client, navigator) = client(spawn_backend(backend.clone()).await, store.clone());

        let err = client.get_json::<Value>("/api/farms").await.unwrap_err();

        assert!(err.is_unauthorized(), "got {err:?}");
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(
            backend.seen_auth(),
            vec![Some("Bearer A1".to_string()), Some("Bearer A2".to_string())]
        );
        assert_eq!(
            store.get(StorageKey::AccessToken).await.unwrap().as_deref(),
            Some("A2")
        );
        assert!(navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn replay_carries_the_original_body() {
        let backend = Backend::new("A2", StatusCode::OK);
        let (client, _) = client(spawn_backend(backend.clone()).await, signed_in());

        let body: Value = client
            .post_json("/api/farms/branding", &json!({ "palette": "earth" }))
            .await
            .unwrap();

        assert_eq!(body, json!({ "data": { "palette": "earth" } }));
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn anonymous_request_has_no_authorization_header() {
        let backend = Backend::new("A2", StatusCode::OK);
        let store = Arc::new(MemoryCredentialStore::new());
        let (client, navigator) = client(spawn_backend(backend.clone()).await, store);

        let err = client.get_json::<Value>("/api/farms").await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(backend.seen_auth(), vec![None]);
        assert_eq!(backend.refresh_calls(), 0);
        assert_eq!(navigator.redirects(), vec!["/"]);
    }

    #[tokio::test]
    async fn non_401_statuses_pass_through_untouched() {
        let backend = Backend::new("A2", StatusCode::OK);
        let (client, navigator) = client(spawn_backend(backend.clone()).await, signed_in());

        let response = client
            .send(client.request(Method::GET, "/api/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err = client
            .get_json::<Value>("/api/does-not-exist")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(backend.refresh_calls(), 0);
        assert!(navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn sign_in_and_logout_round_trip_the_session() {
        let backend = Backend::new("A2", StatusCode::OK);
        let store = Arc::new(MemoryCredentialStore::new());
        let (client, navigator) = client(spawn_backend(backend).await, store.clone());
        assert!(!client.is_authenticated().await.unwrap());

        let mut session = Session::default();
        session.credentials = CredentialPair::new("A1", "R1");
        session.metadata.farm_name = Some("Green Acres".into());
        client.sign_in(&session).await.unwrap();
        assert!(client.is_authenticated().await.unwrap());
        assert_eq!(
            client.session().await.unwrap().metadata.farm_name.as_deref(),
            Some("Green Acres")
        );

        client.logout().await;
        assert!(!client.is_authenticated().await.unwrap());
        assert!(store.is_empty().await);
        assert_eq!(navigator.redirects(), vec!["/"]);
    }
}
