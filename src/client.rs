//! Caller-facing authentication API.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::ClientSettings;
#[cfg(feature = "http")]
use crate::config::AuthConfig;
use crate::error::Error;
#[cfg(feature = "http")]
use crate::provider::HttpProvider;
use crate::provider::{IdentityProvider, Registration, UserUpdate};
use crate::refresh::{AutoRefresh, SessionRefresher};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::store::{JsonFilePersistence, SessionStore};
use crate::types::{Password, User};
use crate::validate::{self, Credentials, Flow, ValidationError};

/// Email/password sign-in request.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: Password,
}

impl LoginRequest {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<Password>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Account creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: Password,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl RegisterRequest {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<Password>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            full_name: None,
        }
    }

    #[must_use]
    pub fn with_full_name(mut self, name: impl Into<String>) -> Self {
        self.full_name = Some(name.into());
        self
    }
}

/// Profile or password change for the signed-in user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub password: Option<Password>,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Result of a login or registration.
///
/// `session` is `None` when the provider created the account but holds the
/// tokens back until the email address is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[non_exhaustive]
pub struct AuthResponse {
    pub user: User,
    pub session: Option<Session>,
}

/// Sign-in, sign-up, refresh and sign-out for one client context.
///
/// The client owns nothing global: each instance holds its own
/// [`SessionStore`], shared by `Arc` with its refresher.
///
/// ```rust,ignore
/// use clientdesk_auth::{AuthClient, AuthConfig, LoginRequest};
///
/// let client = AuthClient::new(AuthConfig::from_env()?)?;
/// let auth = client.login(LoginRequest::new("a@b.com", "secret")).await?;
/// println!("signed in as {}", auth.user.email);
/// ```
pub struct AuthClient<P> {
    provider: Arc<P>,
    store: Arc<SessionStore>,
    refresher: Arc<SessionRefresher<P>>,
    retry: RetryPolicy,
}

#[cfg(feature = "http")]
impl AuthClient<HttpProvider> {
    /// Create a client that talks to the provider's HTTP API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if a configured session file exists but
    /// cannot be loaded.
    pub fn new(config: AuthConfig) -> Result<Self, Error> {
        Self::with_provider(HttpProvider::new(config.provider), config.settings)
    }
}

impl<P: IdentityProvider> AuthClient<P> {
    /// Create a client over any [`IdentityProvider`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if a configured session file exists but
    /// cannot be loaded.
    pub fn with_provider(provider: P, settings: ClientSettings) -> Result<Self, Error> {
        let store = match settings.session_file() {
            Some(path) => SessionStore::with_persistence(JsonFilePersistence::new(path.clone()))?,
            None => SessionStore::new(),
        };
        Ok(Self::from_parts(
            Arc::new(provider),
            Arc::new(store),
            &settings,
        ))
    }

    /// Assemble a client from an existing provider and store.
    #[must_use]
    pub fn from_parts(provider: Arc<P>, store: Arc<SessionStore>, settings: &ClientSettings) -> Self {
        let refresher = SessionRefresher::new(Arc::clone(&provider), Arc::clone(&store))
            .with_grace_window(settings.grace_window())
            .with_retry_policy(settings.retry_policy());
        Self {
            provider,
            store,
            refresher: Arc::new(refresher),
            retry: settings.retry_policy(),
        }
    }

    /// Sign in with email and password.
    ///
    /// On success the new session replaces whatever the store held.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the email or password is malformed; the
    ///   provider is not contacted.
    /// - [`Error::Auth`] if the provider refused or could not be reached.
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse, Error> {
        let credentials = validate::validate(
            Credentials::new(request.email, request.password),
            Flow::Login,
        )?;

        let grant = self
            .retry
            .run("password grant", || self.provider.issue_from_password(&credentials))
            .await?;

        let session = Session::from_grant(grant.tokens, grant.user, OffsetDateTime::now_utc());
        self.store.set(session.clone());
        tracing::info!(
            user_id = %session.user().id,
            expires_at = %session.expires_at(),
            "Signed in"
        );
        Ok(AuthResponse {
            user: session.user().clone(),
            session: Some(session),
        })
    }

    /// Create an account, signing in if the provider issues tokens right away.
    ///
    /// Sign-up is not retried: a lost response may still have created the
    /// account.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the email or password is malformed.
    /// - [`Error::Auth`] if the provider refused or could not be reached.
    pub async fn register(&self, request: RegisterRequest) -> Result<AuthResponse, Error> {
        let credentials = validate::validate(
            Credentials::new(request.email, request.password),
            Flow::Registration,
        )?;

        let registration = self
            .provider
            .issue_from_registration(&credentials, request.full_name.as_deref())
            .await?;

        match registration {
            Registration::Issued(grant) => {
                let session =
                    Session::from_grant(grant.tokens, grant.user, OffsetDateTime::now_utc());
                self.store.set(session.clone());
                tracing::info!(user_id = %session.user().id, "Registered and signed in");
                Ok(AuthResponse {
                    user: session.user().clone(),
                    session: Some(session),
                })
            }
            Registration::PendingConfirmation(user) => {
                tracing::info!(user_id = %user.id, "Registered; email confirmation pending");
                Ok(AuthResponse {
                    user,
                    session: None,
                })
            }
        }
    }

    /// Return a session valid beyond the grace window, refreshing if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAuthenticated`] if no session is held.
    /// - [`Error::Auth`] if the refresh failed. A refused refresh token
    ///   also signs the client out.
    /// - [`Error::Superseded`] if a logout happened while refreshing.
    pub async fn refresh_session(&self) -> Result<Session, Error> {
        let current = self.store.get().ok_or(Error::NotAuthenticated)?;
        self.refresher.refresh(&current).await
    }

    /// Sign out. The local session is dropped first; the server-side revoke
    /// is best effort and its failure is only logged.
    pub async fn logout(&self) {
        let Some(session) = self.store.take() else {
            return;
        };
        tracing::info!(user_id = %session.user().id, "Signed out");
        if let Err(e) = self.provider.revoke(session.access_token()).await {
            tracing::warn!(kind = %e.kind(), error = %e, "Server-side sign-out failed");
        }
    }

    /// Cached user snapshot, if a session with a live access token is held.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        let now = OffsetDateTime::now_utc();
        self.store
            .get()
            .filter(|s| s.is_active_at(now))
            .map(|s| s.user().clone())
    }

    /// The held session, whatever its status.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.store.get()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Fresh copy of the signed-in user from the provider.
    ///
    /// The cached snapshot in the session is updated with the result.
    ///
    /// # Errors
    ///
    /// Same as [`refresh_session`](Self::refresh_session), plus [`Error::Auth`]
    /// if the user lookup fails.
    pub async fn fetch_user(&self) -> Result<User, Error> {
        let session = self.refresh_session().await?;
        let user = self
            .retry
            .run("user fetch", || self.provider.fetch_user(session.access_token()))
            .await?;
        self.remember_user(&session, &user);
        Ok(user)
    }

    /// Change the signed-in user's password or profile.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the request is empty or the new password is
    ///   too short; the provider is not contacted.
    /// - Same as [`refresh_session`](Self::refresh_session) otherwise, plus
    ///   [`Error::Auth`] if the provider rejects the change.
    pub async fn update_user(&self, request: UpdateUserRequest) -> Result<User, Error> {
        if request.password.is_none() && request.full_name.is_none() {
            return Err(ValidationError::new("update", "nothing to update").into());
        }
        if let Some(password) = &request.password {
            validate::validate_password(password, Flow::PasswordUpdate)?;
        }

        let session = self.refresh_session().await?;
        let update = UserUpdate {
            password: request.password,
            full_name: request.full_name,
        };
        let user = self
            .provider
            .update_user(session.access_token(), &update)
            .await?;
        self.remember_user(&session, &user);
        tracing::info!(user_id = %user.id, "User updated");
        Ok(user)
    }

    /// Keep the stored session refreshed in the background until the guard
    /// is dropped. Requires a tokio runtime.
    #[must_use]
    pub fn spawn_auto_refresh(&self) -> AutoRefresh {
        self.refresher.spawn_auto_refresh()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn refresher(&self) -> &SessionRefresher<P> {
        &self.refresher
    }

    /// Swap the user snapshot into the held session if it is still `session`.
    fn remember_user(&self, session: &Session, user: &User) {
        let (generation, held) = self.store.snapshot();
        if held.as_ref() == Some(session) {
            self.store
                .replace_if_current(generation, session.with_user(user.clone()));
        }
    }
}
