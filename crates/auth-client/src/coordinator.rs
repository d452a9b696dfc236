//! Single-flight access token refresh
//!
//! When a request comes back 401 the client hands the failure to the
//! coordinator. The first such request claims the refresh and owns it; every
//! 401 that arrives while it is in flight parks in the `FailedRequestQueue`
//! and gets the owner's outcome. Exactly one refresh call serves them all.
//!
//! Phases:
//! - Idle → Refreshing (first 401 claims the refresh)
//! - Refreshing → Idle (owner settles the queue with a token or an error)
//!
//! The phase and the queue sit behind one `std::sync::Mutex` that is never held
//! across an await. `RefreshGuard` returns the phase to Idle and rejects the
//! queue if the owner is dropped or panics before settling.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use session_auth::{CredentialStore, StorageKey};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::queue::{FailedRequestQueue, RefreshOutcome, Waiter};
use crate::teardown::SessionTeardown;

/// Exchanges a refresh token for a new access token.
///
/// Uses `Pin<Box<dyn Future>>` so the coordinator can hold `Arc<dyn Refresher>`.
pub trait Refresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Secret<String>>> + Send + 'a>>;
}

/// Refresher backed by the backend's `/api/auth/refresh` endpoint.
///
/// Holds its own client handle and never runs the request augmenter, so the
/// refresh call carries no bearer header. A refresh call that never got an
/// answer (timeout, connection failure) is a `RefreshFailed`, not a transport
/// error of the request that triggered it.
pub struct HttpRefresher {
    client: reqwest::Client,
    url: String,
    timeout: Option<Duration>,
}

impl HttpRefresher {
    pub fn new(client: reqwest::Client, url: String, timeout: Option<Duration>) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

impl Refresher for HttpRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Secret<String>>> + Send + 'a>> {
        Box::pin(async move {
            session_auth::refresh_access_token(&self.client, &self.url, refresh_token, self.timeout)
                .await
                .map_err(refresh_error)
        })
    }
}

fn refresh_error(err: session_auth::Error) -> Error {
    match err {
        session_auth::Error::Http(msg) => Error::RefreshFailed(msg),
        other => Error::from(other),
    }
}

/// Coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Refreshing,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    queue: FailedRequestQueue,
}

/// What a 401'd request got when it reached the coordinator.
enum Claim<'a> {
    Owner(RefreshGuard<'a>),
    Waiter(Waiter),
}

/// Proof of refresh ownership. Settling consumes it; dropping it unsettled
/// aborts the refresh for everyone queued behind it.
struct RefreshGuard<'a> {
    state: &'a Mutex<State>,
    settled: bool,
}

impl RefreshGuard<'_> {
    fn settle(mut self, outcome: &RefreshOutcome) -> usize {
        self.settled = true;
        settle(self.state, outcome)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let waiters = settle(self.state, &RefreshOutcome::Failure(Error::RefreshAborted));
            metrics::record_refresh("aborted");
            warn!(waiters, "refresh owner dropped before settling, waiters rejected");
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn settle(state: &Mutex<State>, outcome: &RefreshOutcome) -> usize {
    let mut state = lock(state);
    state.phase = Phase::Idle;
    state.queue.drain(outcome)
}

/// Per-client refresh coordinator.
pub struct RefreshCoordinator {
    state: Mutex<State>,
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn Refresher>,
    teardown: Arc<SessionTeardown>,
    wait_timeout: Option<Duration>,
}

impl RefreshCoordinator {
    /// `wait_timeout` bounds how long a queued request waits for the owner's
    /// refresh; `None` waits for as long as the refresh takes.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn Refresher>,
        teardown: Arc<SessionTeardown>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Idle,
                queue: FailedRequestQueue::new(),
            }),
            store,
            refresher,
            teardown,
            wait_timeout,
        }
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    pub fn is_refreshing(&self) -> bool {
        self.phase() == Phase::Refreshing
    }

    /// Requests currently parked behind the in-flight refresh.
    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn teardown(&self) -> &SessionTeardown {
        &self.teardown
    }

    /// Recover from a 401 on a request that has not been retried yet.
    ///
    /// Returns the access token to replay the request with. On failure the
    /// session has been torn down and the error is what the caller should see:
    /// the original `unauthorized` error when there was no refresh token, the
    /// refresh error otherwise.
    pub async fn recover(&self, unauthorized: Error) -> Result<Secret<String>> {
        match self.claim() {
            Claim::Waiter(waiter) => {
                debug!("refresh already in flight, queueing request");
                metrics::record_waiter();
                waiter.wait(self.wait_timeout).await
            }
            Claim::Owner(guard) => self.refresh(guard, unauthorized).await,
        }
    }

    /// The Idle → Refreshing compare-and-swap.
    fn claim(&self) -> Claim<'_> {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Refreshing => Claim::Waiter(state.queue.enqueue()),
            Phase::Idle => {
                state.phase = Phase::Refreshing;
                Claim::Owner(RefreshGuard {
                    state: &self.state,
                    settled: false,
                })
            }
        }
    }

    async fn refresh(&self, guard: RefreshGuard<'_>, unauthorized: Error) -> Result<Secret<String>> {
        let refresh_token = match session_auth::session::read_token(
            self.store.as_ref(),
            StorageKey::RefreshToken,
        )
        .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("no refresh token stored, ending session");
                self.teardown.run().await;
                guard.settle(&RefreshOutcome::Failure(Error::SessionExpired(
                    "no refresh token stored".into(),
                )));
                metrics::record_refresh("no_refresh_token");
                return Err(unauthorized);
            }
            Err(e) => {
                let err = Error::RefreshFailed(format!("could not read refresh token: {e}"));
                warn!(error = %err, "ending session");
                self.teardown.run().await;
                let outcome = RefreshOutcome::Failure(err.clone());
                guard.settle(&outcome);
                metrics::record_refresh(outcome.label());
                return Err(err);
            }
        };

        debug!("access token rejected, refreshing");
        match self.refresher.refresh(refresh_token.expose()).await {
            Ok(access) => {
                // The refresh token is not rotated by this flow.
                if let Err(e) = self
                    .store
                    .set(StorageKey::AccessToken, access.expose().clone())
                    .await
                {
                    warn!(error = %e, "failed to persist refreshed access token");
                }
                let outcome = RefreshOutcome::Success(access.clone());
                let waiters = guard.settle(&outcome);
                metrics::record_refresh(outcome.label());
                info!(waiters, "access token refreshed");
                Ok(access)
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed, ending session");
                self.teardown.run().await;
                let outcome = RefreshOutcome::Failure(err.clone());
                let waiters = guard.settle(&outcome);
                metrics::record_refresh(outcome.label());
                debug!(waiters, "rejected queued requests");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teardown::tests::RecordingNavigator;
    use session_auth::MemoryCredentialStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Refresher that counts calls and, when gated, holds each call until a
    /// permit is released.
    struct FakeRefresher {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        gate: Option<Semaphore>,
        result: Result<&'static str>,
    }

    impl FakeRefresher {
        fn returning(result: Result<&'static str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                gate: None,
                result,
            }
        }

        fn gated(result: Result<&'static str>) -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::returning(result)
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Refresher for FakeRefresher {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Secret<String>>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.seen.lock().unwrap().push(refresh_token.to_string());
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                self.result
                    .clone()
                    .map(|token| Secret::new(token.to_string()))
            })
        }
    }

    struct Harness {
        coordinator: Arc<RefreshCoordinator>,
        store: Arc<MemoryCredentialStore>,
        refresher: Arc<FakeRefresher>,
        navigator: Arc<RecordingNavigator>,
    }

    fn harness(
        store: MemoryCredentialStore,
        refresher: FakeRefresher,
        wait_timeout: Option<Duration>,
    ) -> Harness {
        let store = Arc::new(store);
        let refresher = Arc::new(refresher);
        let navigator = Arc::new(RecordingNavigator::default());
        let teardown = Arc::new(SessionTeardown::new(store.clone(), navigator.clone(), "/"));
        let coordinator = Arc::new(RefreshCoordinator::new(
            store.clone(),
            refresher.clone(),
            teardown,
            wait_timeout,
        ));
        Harness {
            coordinator,
            store,
            refresher,
            navigator,
        }
    }

    fn signed_in() -> MemoryCredentialStore {
        MemoryCredentialStore::with_entries([
            (StorageKey::AccessToken, "A1"),
            (StorageKey::RefreshToken, "R1"),
            (StorageKey::Email, "grower@example.com"),
        ])
    }

    fn unauthorized() -> Error {
        Error::Status {
            status: 401,
            body: "token expired".into(),
        }
    }

    async fn wait_for_owner(coordinator: &RefreshCoordinator) {
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_queue(coordinator: &RefreshCoordinator, expected: usize) {
        while coordinator.queued() < expected {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_recover(
        coordinator: &Arc<RefreshCoordinator>,
    ) -> tokio::task::JoinHandle<Result<Secret<String>>> {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.recover(unauthorized()).await })
    }

    #[tokio::test]
    async fn concurrent_unauthorized_share_one_refresh() {
        let h = harness(signed_in(), FakeRefresher::gated(Ok("A2")), None);

        let handles: Vec<_> = (0..5).map(|_| spawn_recover(&h.coordinator)).collect();
        wait_for_queue(&h.coordinator, 4).await;
        assert!(h.coordinator.is_refreshing());

        h.refresher.release();
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.expose(), "A2");
        }

        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(*h.refresher.seen.lock().unwrap(), vec!["R1"]);
        assert_eq!(h.coordinator.phase(), Phase::Idle);
        assert_eq!(h.coordinator.queued(), 0);
        assert_eq!(
            h.store.get(StorageKey::AccessToken).await.unwrap().as_deref(),
            Some("A2")
        );
        assert_eq!(
            h.store.get(StorageKey::RefreshToken).await.unwrap().as_deref(),
            Some("R1"),
            "refresh token must not be rotated"
        );
        assert!(h.navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn missing_refresh_token_tears_down_and_returns_original_error() {
        let store = MemoryCredentialStore::with_entries([(StorageKey::AccessToken, "A1")]);
        let h = harness(store, FakeRefresher::returning(Ok("A2")), None);

        let err = h.coordinator.recover(unauthorized()).await.unwrap_err();

        assert!(err.is_unauthorized(), "got {err:?}");
        assert_eq!(h.refresher.calls(), 0);
        assert!(h.store.is_empty().await);
        assert_eq!(h.navigator.redirects(), vec!["/"]);
        assert_eq!(h.coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn refresh_failure_rejects_owner_and_waiters_with_refresh_error() {
        let h = harness(
            signed_in(),
            FakeRefresher::gated(Err(Error::RefreshFailed(
                "refresh endpoint returned 500".into(),
            ))),
            None,
        );

        let handles: Vec<_> = (0..3).map(|_| spawn_recover(&h.coordinator)).collect();
        wait_for_queue(&h.coordinator, 2).await;
        h.refresher.release();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::RefreshFailed(_)), "got {err:?}");
        }
        assert_eq!(h.refresher.calls(), 1);
        assert!(h.store.is_empty().await, "teardown must clear the session");
        assert_eq!(h.navigator.redirects(), vec!["/"]);
        assert_eq!(h.coordinator.phase(), Phase::Idle);
    }

    #[test]
    fn unanswered_refresh_call_is_a_refresh_failure() {
        let err = refresh_error(session_auth::Error::Http("operation timed out".into()));
        assert!(matches!(err, Error::RefreshFailed(ref m) if m.contains("timed out")));

        let err = refresh_error(session_auth::Error::InvalidCredentials("403".into()));
        assert!(matches!(err, Error::RefreshRejected(_)));
    }

    #[tokio::test]
    async fn returns_to_idle_so_later_expiry_refreshes_again() {
        let h = harness(signed_in(), FakeRefresher::returning(Ok("A2")), None);

        h.coordinator.recover(unauthorized()).await.unwrap();
        h.coordinator.recover(unauthorized()).await.unwrap();

        assert_eq!(h.refresher.calls(), 2);
        assert_eq!(h.coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn dropped_owner_aborts_waiters_and_resets() {
        let h = harness(signed_in(), FakeRefresher::gated(Ok("A2")), None);

        let owner = spawn_recover(&h.coordinator);
        wait_for_owner(&h.coordinator).await;
        let waiter = spawn_recover(&h.coordinator);
        wait_for_queue(&h.coordinator, 1).await;

        owner.abort();
        let err = waiter.await.unwrap().unwrap_err();

        assert!(matches!(err, Error::RefreshAborted), "got {err:?}");
        assert_eq!(h.coordinator.phase(), Phase::Idle);
        assert_eq!(h.coordinator.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out_while_owner_hangs() {
        let h = harness(
            signed_in(),
            FakeRefresher::gated(Ok("A2")),
            Some(Duration::from_secs(30)),
        );

        let _owner = spawn_recover(&h.coordinator);
        wait_for_owner(&h.coordinator).await;
        let waiter = spawn_recover(&h.coordinator);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::RefreshTimeout(_)), "got {err:?}");
        assert!(h.coordinator.is_refreshing(), "owner is still in flight");
    }
}
