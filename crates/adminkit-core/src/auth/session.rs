//! Session lifecycle and the token refresh protocol.
//!
//! The session moves through `Unauthenticated -> Initializing ->
//! {Authenticated, Unauthenticated}`, and while authenticated may pass
//! through a transient `Refreshing` phase whenever the backend rejects
//! the access token. The refresh is single-flight: however many requests
//! observe the rejection concurrently, exactly one refresh call goes out
//! and the rest wait in a FIFO queue for its outcome.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::ApiError;

use super::store::TokenStore;

/// Upper bound on a single refresh attempt. A refresh that exceeds this
/// counts as failed, so queued requests can never be starved by a hung
/// refresh call.
const REFRESH_TIMEOUT_SECS: u64 = 15;

/// Capacity of the session-ended broadcast channel. The event fires at
/// most once per forced logout, so a small buffer is plenty.
const END_EVENT_CAPACITY: usize = 8;

/// The bearer credential pair. Both tokens are installed and cleared
/// together; a partial pair is never observable or persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry reported by the backend, when it reports one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenPair {
    /// Build a pair from a wire response; `expires_in` is seconds from now.
    pub fn new(access_token: String, refresh_token: String, expires_in: Option<i64>) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }

    /// Whether the reported expiry has passed. An expired pair is still
    /// usable: the first rejected request triggers a refresh.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() > at,
            None => false,
        }
    }

    /// Minutes remaining until expiry (for display).
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}

/// Internal lifecycle phase. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    Initializing,
    Authenticated,
    Refreshing,
}

/// Session state as collaborators observe it. The transient `Refreshing`
/// phase reports as `Authenticated`: from the outside the session stays
/// signed in for the whole refresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Initializing,
    Authenticated,
}

/// Why a session ended without an explicit logout. Broadcast exactly once
/// per forced logout, so collaborators can show a single notification for
/// the batch of queued requests that failed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    RefreshRejected,
    RefreshTimedOut,
}

/// Exchange of a refresh token for a new credential pair.
///
/// Implemented by the API layer against the backend's refresh endpoint;
/// tests substitute stubs.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;
}

struct Inner {
    phase: Phase,
    pair: Option<TokenPair>,
    /// Callers suspended on the in-flight refresh, in arrival order.
    /// Non-empty only while the phase is `Refreshing`.
    waiters: VecDeque<oneshot::Sender<Result<String, ApiError>>>,
}

/// Owner of all shared session state. The mutex guards exactly the
/// phase, the current pair, and the waiter queue; the refresh network
/// call itself runs outside it, so requests untouched by the refresh
/// proceed unimpeded.
pub struct SessionManager {
    inner: Mutex<Inner>,
    store: TokenStore,
    refresher: Arc<dyn TokenRefresher>,
    refresh_timeout: Duration,
    state_tx: watch::Sender<SessionState>,
    ended_tx: broadcast::Sender<SessionEndReason>,
}

impl SessionManager {
    pub fn new(store: TokenStore, refresher: Arc<dyn TokenRefresher>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Initializing);
        let (ended_tx, _) = broadcast::channel(END_EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Initializing,
                pair: None,
                waiters: VecDeque::new(),
            }),
            store,
            refresher,
            refresh_timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
            state_tx,
            ended_tx,
        }
    }

    /// Override the refresh timeout (tests use short ones).
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Restore the session persisted by a previous run. A stored pair is
    /// trusted without a network round trip; if it has gone stale the
    /// first authenticated request will be rejected and recovered there.
    pub async fn initialize(&self) -> Result<SessionState, ApiError> {
        let mut inner = self.inner.lock().await;
        let state = match self.store.load()? {
            Some(pair) => {
                debug!("restored persisted session");
                inner.pair = Some(pair);
                inner.phase = Phase::Authenticated;
                SessionState::Authenticated
            }
            None => {
                inner.phase = Phase::Unauthenticated;
                SessionState::Unauthenticated
            }
        };
        self.state_tx.send_replace(state);
        Ok(state)
    }

    /// Current externally visible state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions (restore, login, logout). The transient
    /// refresh window is not visible here.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Receive the forced-logout notification. Fired exactly once per
    /// failed refresh and never on explicit logout.
    pub fn subscribe_ended(&self) -> broadcast::Receiver<SessionEndReason> {
        self.ended_tx.subscribe()
    }

    /// Access token to attach to the next outgoing request, if a session
    /// exists.
    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .pair
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    /// Snapshot of the current pair (status display).
    pub async fn current_pair(&self) -> Option<TokenPair> {
        self.inner.lock().await.pair.clone()
    }

    /// Install a freshly issued pair (login). The pair is durably
    /// persisted before the session reports authenticated. A login that
    /// lands while a refresh is in flight resumes any queued requests
    /// with the new token.
    pub async fn install(&self, pair: TokenPair) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().await;
        self.store.save(&pair)?;
        let token = pair.access_token.clone();
        inner.pair = Some(pair);
        inner.phase = Phase::Authenticated;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Ok(token.clone()));
        }
        self.state_tx.send_replace(SessionState::Authenticated);
        info!("session established");
        Ok(())
    }

    /// Drop the session locally, unconditionally. Used by logout whether
    /// or not the server acknowledged. Any refresh waiters fail now; the
    /// outcome of an in-flight refresh is discarded when it lands.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to remove session record");
        }
        inner.pair = None;
        inner.phase = Phase::Unauthenticated;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Err(ApiError::SessionExpired));
        }
        self.state_tx.send_replace(SessionState::Unauthenticated);
        info!("session cleared");
    }

    /// Recover from a rejected access token.
    ///
    /// Single-flight: the first caller to observe the rejection becomes
    /// the leader and drives the refresh; everyone else queues and is
    /// resumed with the leader's outcome, in arrival order. A caller
    /// whose rejected token is already outdated (a refresh completed in
    /// between) gets the current token back with no network call.
    ///
    /// Returns the access token to retry with, or `SessionExpired` when
    /// the refresh protocol could not produce one.
    pub async fn recover(&self, rejected_token: &str) -> Result<String, ApiError> {
        // Decisions and queue mutation happen under the lock; the refresh
        // call itself must not.
        let refresh_token;
        {
            let mut inner = self.inner.lock().await;
            match inner.phase {
                Phase::Refreshing => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(tx);
                    drop(inner);
                    debug!("refresh in flight, queueing request");
                    return match rx.await {
                        Ok(outcome) => outcome,
                        // Sender dropped without resolving; the session is
                        // gone.
                        Err(_) => Err(ApiError::SessionExpired),
                    };
                }
                Phase::Authenticated => {
                    let current = inner
                        .pair
                        .as_ref()
                        .map(|p| (p.access_token.clone(), p.refresh_token.clone()));
                    match current {
                        Some((access, _)) if access != rejected_token => {
                            return Ok(access);
                        }
                        Some((_, refresh)) => {
                            refresh_token = refresh;
                            inner.phase = Phase::Refreshing;
                        }
                        None => return Err(ApiError::SessionExpired),
                    }
                }
                Phase::Unauthenticated | Phase::Initializing => {
                    return Err(ApiError::SessionExpired);
                }
            }
        }

        info!("access token rejected, refreshing session");
        let outcome = tokio::time::timeout(
            self.refresh_timeout,
            self.refresher.refresh(&refresh_token),
        )
        .await;

        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Refreshing {
            // A logout raced the refresh; its outcome no longer applies
            // and the waiters were already resolved.
            return Err(ApiError::SessionExpired);
        }
        match outcome {
            Ok(Ok(pair)) => match self.store.save(&pair) {
                Ok(()) => {
                    let token = pair.access_token.clone();
                    inner.pair = Some(pair);
                    inner.phase = Phase::Authenticated;
                    for waiter in inner.waiters.drain(..) {
                        let _ = waiter.send(Ok(token.clone()));
                    }
                    debug!("session refreshed");
                    Ok(token)
                }
                Err(err) => {
                    // A pair that cannot be durably persisted would
                    // desync memory from disk across a restart; treat it
                    // as a failed refresh.
                    warn!(error = %err, "could not persist refreshed session");
                    self.expire(&mut inner, SessionEndReason::RefreshRejected);
                    Err(ApiError::SessionExpired)
                }
            },
            Ok(Err(err)) => {
                warn!(error = %err, "refresh rejected by server");
                self.expire(&mut inner, SessionEndReason::RefreshRejected);
                Err(ApiError::SessionExpired)
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.refresh_timeout.as_secs(),
                    "refresh timed out"
                );
                self.expire(&mut inner, SessionEndReason::RefreshTimedOut);
                Err(ApiError::SessionExpired)
            }
        }
    }

    /// Forced logout: clear everything, fail every waiter, notify once.
    fn expire(&self, inner: &mut Inner, reason: SessionEndReason) {
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to remove session record");
        }
        inner.pair = None;
        inner.phase = Phase::Unauthenticated;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Err(ApiError::SessionExpired));
        }
        self.state_tx.send_replace(SessionState::Unauthenticated);
        let _ = self.ended_tx.send(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    struct StubRefresher {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl StubRefresher {
        fn succeeding(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        fn failing(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for StubRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(ApiError::Unauthorized)
            } else {
                Ok(pair("t2", "r2"))
            }
        }
    }

    fn pair(access: &str, refresh: &str) -> TokenPair {
        TokenPair::new(access.to_string(), refresh.to_string(), Some(1800))
    }

    fn store_in(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path().to_path_buf())
    }

    async fn authed_manager(
        dir: &tempfile::TempDir,
        refresher: Arc<dyn TokenRefresher>,
    ) -> SessionManager {
        let manager = SessionManager::new(store_in(dir), refresher);
        manager.install(pair("t1", "r1")).await.expect("install");
        manager
    }

    #[tokio::test]
    async fn concurrent_rejections_share_one_refresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(50)));
        let manager = Arc::new(authed_manager(&dir, refresher.clone()).await);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.recover("t1").await })
            })
            .collect();

        for result in join_all(tasks).await {
            let token = result.expect("task").expect("recovered");
            assert_eq!(token, "t2");
        }
        assert_eq!(refresher.call_count(), 1);
        assert_eq!(manager.state(), SessionState::Authenticated);

        // The rotated refresh token was persisted.
        let persisted = store_in(&dir).load().expect("load").expect("pair");
        assert_eq!(persisted.access_token, "t2");
        assert_eq!(persisted.refresh_token, "r2");
    }

    #[tokio::test]
    async fn failed_refresh_fails_every_waiter_and_ends_session_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::failing(Duration::from_millis(50)));
        let manager = Arc::new(authed_manager(&dir, refresher.clone()).await);
        let mut ended = manager.subscribe_ended();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.recover("t1").await })
            })
            .collect();

        for result in join_all(tasks).await {
            let outcome = result.expect("task");
            assert!(matches!(outcome, Err(ApiError::SessionExpired)));
        }
        assert_eq!(refresher.call_count(), 1);
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store_in(&dir).load().expect("load").is_none());

        assert_eq!(
            ended.try_recv().expect("one event"),
            SessionEndReason::RefreshRejected
        );
        assert!(matches!(ended.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn stale_rejection_after_refresh_returns_current_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(1)));
        let manager = authed_manager(&dir, refresher.clone()).await;

        // A refresh already rotated the pair to t2.
        manager.install(pair("t2", "r2")).await.expect("install");

        let token = manager.recover("t1").await.expect("recover");
        assert_eq!(token, "t2");
        assert_eq!(refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn refresh_timeout_ends_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_secs(30)));
        let manager = SessionManager::new(store_in(&dir), refresher.clone())
            .with_refresh_timeout(Duration::from_millis(50));
        manager.install(pair("t1", "r1")).await.expect("install");
        let mut ended = manager.subscribe_ended();

        let outcome = manager.recover("t1").await;
        assert!(matches!(outcome, Err(ApiError::SessionExpired)));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store_in(&dir).load().expect("load").is_none());
        assert_eq!(
            ended.try_recv().expect("one event"),
            SessionEndReason::RefreshTimedOut
        );
    }

    #[tokio::test]
    async fn logout_during_refresh_discards_the_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(200)));
        let manager = Arc::new(authed_manager(&dir, refresher.clone()).await);
        let mut ended = manager.subscribe_ended();

        let leader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.recover("t1").await })
        };
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                manager.recover("t1").await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.reset().await;

        assert!(matches!(
            leader.await.expect("leader"),
            Err(ApiError::SessionExpired)
        ));
        assert!(matches!(
            waiter.await.expect("waiter"),
            Err(ApiError::SessionExpired)
        ));
        assert_eq!(manager.state(), SessionState::Unauthenticated);
        assert!(store_in(&dir).load().expect("load").is_none());
        // An explicit logout is not a forced one; no event fires.
        assert!(matches!(ended.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn initialize_restores_persisted_pair_without_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        store_in(&dir).save(&pair("t1", "r1")).expect("seed");

        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(1)));
        let manager = SessionManager::new(store_in(&dir), refresher.clone());
        assert_eq!(manager.state(), SessionState::Initializing);

        let state = manager.initialize().await.expect("initialize");
        assert_eq!(state, SessionState::Authenticated);
        assert_eq!(manager.access_token().await.as_deref(), Some("t1"));
        assert_eq!(refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn initialize_without_record_is_unauthenticated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(1)));
        let manager = SessionManager::new(store_in(&dir), refresher);

        let state = manager.initialize().await.expect("initialize");
        assert_eq!(state, SessionState::Unauthenticated);
        assert!(manager.access_token().await.is_none());
    }

    #[tokio::test]
    async fn recover_without_session_is_terminal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(1)));
        let manager = SessionManager::new(store_in(&dir), refresher.clone());
        manager.initialize().await.expect("initialize");

        let outcome = manager.recover("t1").await;
        assert!(matches!(outcome, Err(ApiError::SessionExpired)));
        assert_eq!(refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn refresh_window_is_invisible_to_state_observers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::succeeding(Duration::from_millis(50)));
        let manager = authed_manager(&dir, refresher.clone()).await;

        let mut state = manager.subscribe_state();
        state.mark_unchanged();

        manager.recover("t1").await.expect("recover");
        assert_eq!(refresher.call_count(), 1);

        // The session stayed signed in from the outside for the whole
        // refresh window; no transition was published.
        assert!(!state.has_changed().expect("sender alive"));
        assert_eq!(*state.borrow(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn state_observers_see_login_and_forced_logout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let refresher = Arc::new(StubRefresher::failing(Duration::from_millis(10)));
        let manager = SessionManager::new(store_in(&dir), refresher);
        let mut state = manager.subscribe_state();
        assert_eq!(*state.borrow_and_update(), SessionState::Initializing);

        manager.install(pair("t1", "r1")).await.expect("install");
        assert!(state.has_changed().expect("sender alive"));
        assert_eq!(*state.borrow_and_update(), SessionState::Authenticated);

        let outcome = manager.recover("t1").await;
        assert!(matches!(outcome, Err(ApiError::SessionExpired)));
        assert_eq!(*state.borrow_and_update(), SessionState::Unauthenticated);
    }

    #[test]
    fn token_pair_expiry_helpers() {
        let fresh = TokenPair::new("a".to_string(), "r".to_string(), Some(600));
        assert!(!fresh.is_expired());
        assert!(fresh.minutes_until_expiry().expect("expiry known") >= 9);

        let stale = TokenPair::new("a".to_string(), "r".to_string(), Some(-60));
        assert!(stale.is_expired());
        assert_eq!(stale.minutes_until_expiry(), Some(0));

        let unknown = TokenPair::new("a".to_string(), "r".to_string(), None);
        assert!(!unknown.is_expired());
        assert!(unknown.minutes_until_expiry().is_none());
    }
}
