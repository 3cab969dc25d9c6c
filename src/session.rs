//! Session gatekeeper
//!
//! Wraps the external session provider behind one small surface: "give me a
//! verified session, refreshing if needed" and "run this operation with a
//! verified session, retrying token-shaped failures". State machine over one
//! session value:
//!
//! ```text
//! Unauthenticated ──sign-in──► Valid ──near expiry──► Refreshing
//!       ▲                        ▲                        │
//!       │                        ├──refresh ok────────────┤
//!    sign-out                    │                        │
//!       │                   ValidStale ◄──refresh failed──┘
//! ```
//!
//! A failed refresh is deliberately non-fatal: the stale token keeps being
//! used until it hard-expires, with a warning, instead of forcing sign-out.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::remote::SessionProvider;

/// Ephemeral credential bundle from the session provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub principal_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Mint a session valid for `ttl` (used by providers and tests).
    pub fn new(principal_id: &str, ttl: Duration) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            access_token: uuid::Uuid::new_v4().to_string(),
            refresh_token: uuid::Uuid::new_v4().to_string(),
            expires_at: Utc::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero()),
        }
    }

    /// Whether the token has hard-expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the token expires within the given window.
    pub fn expires_within(&self, window: Duration) -> bool {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        Utc::now() + window >= self.expires_at
    }
}

/// Session change notification forwarded to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// Gatekeeper state over the one cached session value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    Valid,
    Refreshing,
    /// Refresh failed; the old token is used until it hard-expires.
    ValidStale,
}

/// Guards every remote call behind a verified session.
pub struct SessionGatekeeper {
    provider: Arc<dyn SessionProvider>,
    state: Mutex<SessionState>,
    refresh_window: Duration,
    auth_retries: u32,
    auth_backoff: Duration,
    signed_out_debounce: Duration,
    /// Events are suppressed until this instant
    ignore_until: Mutex<Option<Instant>>,
    /// Last forwarded signed-out event, for duplicate suppression
    last_signed_out: Mutex<Option<Instant>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionGatekeeper {
    pub fn new(provider: Arc<dyn SessionProvider>, config: &SyncConfig) -> Self {
        let (events_tx, _) = broadcast::channel(32);
        Self {
            provider,
            state: Mutex::new(SessionState::Unauthenticated),
            refresh_window: config.refresh_window(),
            auth_retries: config.auth_retries,
            auth_backoff: config.auth_backoff(),
            signed_out_debounce: config.signed_out_debounce(),
            ignore_until: Mutex::new(None),
            last_signed_out: Mutex::new(None),
            events_tx,
        }
    }

    /// Current state (for status display and tests).
    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Subscribe to the filtered session event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Return a session that is safe to use for a remote call, refreshing if
    /// it is within the refresh window of expiry.
    pub async fn verified_session(&self) -> Result<Session, RemoteError> {
        let Some(session) = self.provider.get_current_session().await else {
            *self.state.lock().await = SessionState::Unauthenticated;
            return Err(RemoteError::NotSignedIn);
        };

        if !session.expires_within(self.refresh_window) {
            *self.state.lock().await = SessionState::Valid;
            return Ok(session);
        }

        *self.state.lock().await = SessionState::Refreshing;
        match self.refresh_quietly().await {
            Ok(fresh) => {
                *self.state.lock().await = SessionState::Valid;
                Ok(fresh)
            }
            Err(e) if !session.is_expired() => {
                // Keep using the old token until it hard-expires
                warn!(error = %e, "Session refresh failed, continuing with stale token");
                *self.state.lock().await = SessionState::ValidStale;
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed and token is expired");
                Err(RemoteError::RefreshFailed(e.to_string()))
            }
        }
    }

    /// Run `op` with a verified principal, retrying token-shaped failures.
    ///
    /// Auth failures (expired/invalid token) are retried up to the configured
    /// limit with doubling backoff, refreshing the session between attempts.
    /// Any other failure, including `PermissionDenied`, propagates
    /// immediately.
    pub async fn with_verified_session<T, F, Fut>(&self, op: F) -> Result<T, RemoteError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let session = self.verified_session().await?;
            match op(session.principal_id.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() && attempt < self.auth_retries => {
                    attempt += 1;
                    let delay = self.auth_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Auth failure, refreshing session and retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(refresh_err) = self.refresh_quietly().await {
                        warn!(error = %refresh_err, "Refresh between retries failed");
                        *self.state.lock().await = SessionState::ValidStale;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Suppress session-changed notifications for `duration`.
    ///
    /// Silent token rotation during background sync must not reach the UI as
    /// a sign-out/sign-in flicker.
    pub async fn ignore_events_for(&self, duration: Duration) {
        *self.ignore_until.lock().await = Some(Instant::now() + duration);
    }

    /// Apply the suppression window and duplicate signed-out debounce to a
    /// provider event. Returns the event if it should reach the UI.
    pub async fn filter_event(&self, event: SessionEvent) -> Option<SessionEvent> {
        if let Some(until) = *self.ignore_until.lock().await {
            if Instant::now() < until {
                debug!(event = ?event, "Suppressed session event");
                return None;
            }
        }

        match event {
            SessionEvent::SignedOut => {
                let mut last = self.last_signed_out.lock().await;
                if let Some(previous) = *last {
                    if previous.elapsed() < self.signed_out_debounce {
                        debug!("Dropped duplicate signed-out event");
                        return None;
                    }
                }
                *last = Some(Instant::now());
                *self.state.lock().await = SessionState::Unauthenticated;
                Some(SessionEvent::SignedOut)
            }
            SessionEvent::SignedIn => {
                *self.state.lock().await = SessionState::Valid;
                Some(SessionEvent::SignedIn)
            }
            SessionEvent::TokenRefreshed => Some(SessionEvent::TokenRefreshed),
        }
    }

    /// Spawn the provider → UI event forwarding loop.
    pub fn run_event_forwarder(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gatekeeper = Arc::clone(self);
        let mut rx = gatekeeper.provider.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let Some(event) = gatekeeper.filter_event(event).await {
                    let _ = gatekeeper.events_tx.send(event);
                }
            }
            debug!("Session event forwarder stopped");
        })
    }

    /// Sign out through the provider and reset state.
    pub async fn sign_out(&self) {
        self.provider.sign_out().await;
        *self.state.lock().await = SessionState::Unauthenticated;
        info!("Signed out");
    }

    /// Refresh with event suppression active, so rotation does not surface
    /// as UI churn.
    async fn refresh_quietly(&self) -> Result<Session, RemoteError> {
        self.ignore_events_for(self.signed_out_debounce).await;
        self.provider.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemorySessionProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> SyncConfig {
        SyncConfig::for_tests(std::env::temp_dir())
    }

    fn gatekeeper(provider: Arc<InMemorySessionProvider>) -> SessionGatekeeper {
        SessionGatekeeper::new(provider, &test_config())
    }

    #[tokio::test]
    async fn test_verified_session_when_valid() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let keeper = gatekeeper(Arc::clone(&provider));

        let session = keeper.verified_session().await.unwrap();
        assert_eq!(session.principal_id, "alice");
        assert_eq!(keeper.state().await, SessionState::Valid);
        assert_eq!(provider.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_not_signed_in() {
        let provider = Arc::new(InMemorySessionProvider::signed_out());
        let keeper = gatekeeper(provider);

        let err = keeper.verified_session().await.unwrap_err();
        assert!(matches!(err, RemoteError::NotSignedIn));
        assert_eq!(keeper.state().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_refresh_near_expiry() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        // Session expiring inside the 60s refresh window
        provider
            .set_session(Some(Session::new("alice", Duration::from_secs(10))))
            .await;
        let keeper = gatekeeper(Arc::clone(&provider));

        let session = keeper.verified_session().await.unwrap();
        assert!(!session.expires_within(Duration::from_secs(60)));
        assert_eq!(provider.refresh_count(), 1);
        assert_eq!(keeper.state().await, SessionState::Valid);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_stale_token() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let near_expiry = Session::new("alice", Duration::from_secs(10));
        provider.set_session(Some(near_expiry.clone())).await;
        provider.fail_next_refreshes(1);
        let keeper = gatekeeper(Arc::clone(&provider));

        let session = keeper.verified_session().await.unwrap();
        assert_eq!(session.access_token, near_expiry.access_token);
        assert_eq!(keeper.state().await, SessionState::ValidStale);
    }

    #[tokio::test]
    async fn test_retries_auth_errors_only() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let keeper = gatekeeper(Arc::clone(&provider));

        // Token expiry: fails twice, then succeeds
        let failures = AtomicU32::new(2);
        let result = keeper
            .with_verified_session(|principal| {
                let remaining = failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(1))
                });
                async move {
                    if remaining.unwrap() > 0 {
                        Err(RemoteError::TokenExpired)
                    } else {
                        Ok(principal)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "alice");

        // Permission denied propagates without retry
        let attempts = AtomicU32::new(0);
        let err = keeper
            .with_verified_session(|principal| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(RemoteError::PermissionDenied(principal)) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::PermissionDenied(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_retry_limit() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let keeper = gatekeeper(provider);

        let attempts = AtomicU32::new(0);
        let err = keeper
            .with_verified_session(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(RemoteError::TokenExpired) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::TokenExpired));
        // Initial attempt plus three retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_event_suppression_window() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let keeper = gatekeeper(provider);

        keeper.ignore_events_for(Duration::from_secs(30)).await;
        assert_eq!(keeper.filter_event(SessionEvent::SignedOut).await, None);
        assert_eq!(keeper.filter_event(SessionEvent::TokenRefreshed).await, None);
    }

    #[tokio::test]
    async fn test_duplicate_signed_out_debounce() {
        let provider = Arc::new(InMemorySessionProvider::signed_in("alice"));
        let keeper = gatekeeper(provider);

        assert_eq!(
            keeper.filter_event(SessionEvent::SignedOut).await,
            Some(SessionEvent::SignedOut)
        );
        // Immediate duplicate is dropped
        assert_eq!(keeper.filter_event(SessionEvent::SignedOut).await, None);

        // After the debounce window it goes through again
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            keeper.filter_event(SessionEvent::SignedOut).await,
            Some(SessionEvent::SignedOut)
        );
    }
}
