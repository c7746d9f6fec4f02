//! Session refresh: grace-window state machine, single-flight coalescing,
//! and the optional background refresh task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::error::{AuthError, AuthErrorKind, Error};
use crate::provider::IdentityProvider;
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionStatus};
use crate::store::SessionStore;

/// Default margin before expiry at which a refresh is triggered.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(60);

/// Pause after a failed background refresh before trying again.
const AUTO_REFRESH_BACKOFF: Duration = Duration::from_secs(5);

/// SHA-256 of a refresh token; the coalescing key, so raw tokens are never
/// kept as map keys.
type Fingerprint = [u8; 32];

type SharedRefresh = Shared<BoxFuture<'static, Result<Session, Error>>>;

/// Last refused refresh token and the refusal it got.
type Refusal = Option<(Fingerprint, AuthError)>;

fn fingerprint(refresh_token: &str) -> Fingerprint {
    Sha256::digest(refresh_token.as_bytes()).into()
}

/// Provider answers that mean the refresh token itself was refused.
fn rejects_session(kind: AuthErrorKind) -> bool {
    matches!(
        kind,
        AuthErrorKind::InvalidCredentials
            | AuthErrorKind::UserNotFound
            | AuthErrorKind::EmailNotConfirmed
    )
}

/// Refreshes sessions held in a [`SessionStore`].
///
/// At most one provider call is in flight per refresh token; concurrent
/// callers share it and observe the same outcome.
pub struct SessionRefresher<P> {
    provider: Arc<P>,
    store: Arc<SessionStore>,
    retry: RetryPolicy,
    grace: Duration,
    in_flight: Mutex<HashMap<Fingerprint, SharedRefresh>>,
    rejected: Arc<Mutex<Refusal>>,
}

impl<P: IdentityProvider> SessionRefresher<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, store: Arc<SessionStore>) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            grace: DEFAULT_GRACE_WINDOW,
            in_flight: Mutex::new(HashMap::new()),
            rejected: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn grace_window(&self) -> Duration {
        self.grace
    }

    /// Status of `session`, including `Invalid` once its refresh token was refused.
    #[must_use]
    pub fn status(&self, session: &Session) -> SessionStatus {
        if self.refusal_for(&fingerprint(session.refresh_token())).is_some() {
            return SessionStatus::Invalid;
        }
        session.status(self.grace)
    }

    fn refusal_for(&self, key: &Fingerprint) -> Option<AuthError> {
        match &*self.rejected.lock() {
            Some((rejected, err)) if rejected == key => Some(err.clone()),
            _ => None,
        }
    }

    /// Returns a session that is valid beyond the grace window.
    ///
    /// - `Valid`: `current` is returned unchanged, no provider call.
    /// - `Expiring` / `Expired`: one refresh-token grant; the result replaces
    ///   the stored session if the store did not change meanwhile.
    /// - `Invalid`: the refusal that invalidated the session is returned again.
    ///
    /// The provider is only called while the store still holds `current`.
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] if the provider refused or could not be reached.
    ///   A refusal clears the store and makes the session `Invalid`.
    /// - [`Error::NotAuthenticated`] if the store is empty.
    /// - [`Error::Superseded`] if the store holds another session, or a logout
    ///   or login happened while the call was in flight; the refreshed tokens
    ///   are discarded.
    pub async fn refresh(&self, current: &Session) -> Result<Session, Error> {
        let key = fingerprint(current.refresh_token());
        if let Some(refusal) = self.refusal_for(&key) {
            return Err(refusal.into());
        }
        if current.status(self.grace) == SessionStatus::Valid {
            return Ok(current.clone());
        }

        let handle = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(flight) => {
                    tracing::debug!(user_id = %current.user().id, "Joining in-flight refresh");
                    flight.clone()
                }
                None => {
                    let flight = self.start(current.clone(), key).boxed().shared();
                    in_flight.insert(key, flight.clone());
                    flight
                }
            }
        };

        let mut flight = Flight {
            in_flight: &self.in_flight,
            key,
            handle: None,
        };
        let result = flight.handle.insert(handle).await;
        drop(flight);
        result
    }

    /// The provider call plus the store commit, as one owned future.
    ///
    /// The commit is a single synchronous step after the provider answered,
    /// so dropping this future never leaves the store half-updated.
    fn start(
        &self,
        current: Session,
        key: Fingerprint,
    ) -> impl Future<Output = Result<Session, Error>> + Send + 'static {
        let provider = Arc::clone(&self.provider);
        let store = Arc::clone(&self.store);
        let rejected = Arc::clone(&self.rejected);
        let retry = self.retry;
        let grace = self.grace;

        async move {
            let (generation, held) = store.snapshot();
            let Some(held) = held else {
                tracing::debug!(user_id = %current.user().id, "Store empty; refresh skipped");
                return Err(Error::NotAuthenticated);
            };
            if held.refresh_token() != current.refresh_token() {
                if held.user().id == current.user().id && held.status(grace) == SessionStatus::Valid
                {
                    tracing::debug!(user_id = %held.user().id, "Session already rotated");
                    return Ok(held);
                }
                tracing::debug!(user_id = %current.user().id, "Session replaced; refresh skipped");
                return Err(Error::Superseded);
            }

            tracing::debug!(user_id = %current.user().id, "Refreshing session");
            let refresh_token = current.refresh_token();
            let result = retry
                .run("refresh grant", || provider.refresh(refresh_token))
                .await;

            match result {
                Ok(grant) => {
                    let session =
                        Session::from_grant(grant.tokens, grant.user, OffsetDateTime::now_utc());
                    if store.replace_if_current(generation, session.clone()) {
                        tracing::info!(
                            user_id = %session.user().id,
                            expires_at = %session.expires_at(),
                            "Session refreshed"
                        );
                        Ok(session)
                    } else {
                        tracing::info!("Session changed during refresh; result discarded");
                        Err(Error::Superseded)
                    }
                }
                Err(err) if rejects_session(err.kind()) => {
                    *rejected.lock() = Some((key, err.clone()));
                    if store.invalidate(generation, current.refresh_token()) {
                        tracing::warn!(
                            user_id = %current.user().id,
                            kind = %err.kind(),
                            "Refresh token refused; session invalidated"
                        );
                    }
                    Err(err.into())
                }
                Err(err) => {
                    tracing::warn!(kind = %err.kind(), error = %err, "Session refresh failed");
                    Err(err.into())
                }
            }
        }
    }

    /// Spawns a task that refreshes the stored session when it enters the
    /// grace window. The task stops when the returned guard is dropped.
    #[must_use]
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> AutoRefresh {
        let refresher = Arc::clone(self);
        let handle = tokio::spawn(async move { refresher.auto_refresh_loop().await });
        AutoRefresh { handle }
    }

    async fn auto_refresh_loop(&self) {
        let mut changes = self.store.subscribe();
        loop {
            changes.borrow_and_update();
            let held = self.store.get();
            let due_in = held
                .as_ref()
                .filter(|s| self.status(s) != SessionStatus::Invalid)
                .map(|s| until(s.refresh_due_at(self.grace)));

            tokio::select! {
                biased;
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                () = sleep_or_forever(due_in) => {}
            }

            let Some(session) = held else { continue };
            let pause = match self.refresh(&session).await {
                Ok(fresh) if fresh.status(self.grace) == SessionStatus::Valid => None,
                Ok(_) => Some(AUTO_REFRESH_BACKOFF),
                Err(Error::Superseded | Error::NotAuthenticated) => None,
                Err(Error::Auth(e)) if e.kind() == AuthErrorKind::RateLimited => {
                    Some(e.retry_after().unwrap_or(AUTO_REFRESH_BACKOFF))
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Background refresh failed");
                    Some(AUTO_REFRESH_BACKOFF)
                }
            };
            if let Some(pause) = pause {
                tokio::time::sleep(pause).await;
            }
        }
    }
}

/// One caller's handle on a coalesced refresh.
///
/// Dropping it, on completion or cancellation, removes the in-flight entry
/// once no other caller waits on it, so a refresh abandoned by every caller
/// does not keep its provider request parked in the map.
struct Flight<'a> {
    in_flight: &'a Mutex<HashMap<Fingerprint, SharedRefresh>>,
    key: Fingerprint,
    handle: Option<SharedRefresh>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        drop(self.handle.take());
        let mut in_flight = self.in_flight.lock();
        // the map's own handle is never polled, so its count is the number
        // of live handles: 1 means only the map is left
        let idle = in_flight
            .get(&self.key)
            .is_some_and(|f| f.strong_count().is_none_or(|n| n <= 1));
        if idle {
            in_flight.remove(&self.key);
        }
    }
}

fn until(at: OffsetDateTime) -> Duration {
    Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or(Duration::ZERO)
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

/// Guard for the background refresh task; aborts the task on drop.
#[derive(Debug)]
pub struct AutoRefresh {
    handle: JoinHandle<()>,
}

impl AutoRefresh {
    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
