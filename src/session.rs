use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{TokenPair, User};

/// Authenticated session: tokens, derived expiry and a user snapshot.
///
/// `expires_at` only comes from [`Session::from_grant`]; there is no setter.
/// A session is replaced as a whole, never patched.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    access_token: String,
    refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
    user: User,
}

/// Validity of a session at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// More than the grace window left before expiry.
    Valid,
    /// Inside the grace window; a refresh should happen now.
    Expiring,
    /// Access token expired; the refresh token may still be accepted.
    Expired,
    /// Refresh token rejected. Terminal until new credentials are supplied.
    Invalid,
}

impl Session {
    /// Builds a session from an issuance or refresh result.
    ///
    /// `issued_at` is the instant the provider's answer was received.
    #[must_use]
    pub fn from_grant(tokens: TokenPair, user: User, issued_at: OffsetDateTime) -> Self {
        let lifetime = time::Duration::try_from(Duration::from_secs(tokens.expires_in))
            .unwrap_or(time::Duration::MAX);
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: issued_at.saturating_add(lifetime),
            user,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Same tokens with a newer user snapshot.
    #[must_use]
    pub(crate) fn with_user(&self, user: User) -> Self {
        Self {
            user,
            ..self.clone()
        }
    }

    /// Classifies the session at `now`. Never returns `Invalid`; that state
    /// is only reached through a rejected refresh.
    #[must_use]
    pub fn status_at(&self, now: OffsetDateTime, grace: Duration) -> SessionStatus {
        if now >= self.expires_at {
            SessionStatus::Expired
        } else if now >= self.refresh_due_at(grace) {
            SessionStatus::Expiring
        } else {
            SessionStatus::Valid
        }
    }

    #[must_use]
    pub fn status(&self, grace: Duration) -> SessionStatus {
        self.status_at(OffsetDateTime::now_utc(), grace)
    }

    /// Whether the access token is still usable at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }

    /// Instant at which a proactive refresh becomes due.
    #[must_use]
    pub fn refresh_due_at(&self, grace: Duration) -> OffsetDateTime {
        let grace = time::Duration::try_from(grace).unwrap_or(time::Duration::MAX);
        self.expires_at.saturating_sub(grace)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user.id)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::TokenType;

    pub(crate) fn pair(access: &str, refresh: &str, expires_in: u64) -> TokenPair {
        TokenPair {
            access_token: access.into(),
            refresh_token: refresh.into(),
            token_type: TokenType::Bearer,
            expires_in,
        }
    }

    /// Session issued `age` ago with the given lifetime.
    pub(crate) fn session_aged(refresh: &str, expires_in: u64, age: Duration) -> Session {
        let issued_at = OffsetDateTime::now_utc() - age;
        Session::from_grant(
            pair("AT-old", refresh, expires_in),
            User::new("u1", "a@b.com"),
            issued_at,
        )
    }

    const GRACE: Duration = Duration::from_secs(60);

    #[test]
    fn expires_at_is_issued_at_plus_expires_in() {
        let issued_at = OffsetDateTime::now_utc();
        let session = Session::from_grant(pair("AT1", "RT1", 3600), User::new("u1", "a@b.com"), issued_at);
        assert_eq!(session.expires_at() - issued_at, time::Duration::seconds(3600));
    }

    #[test]
    fn status_transitions() {
        let issued_at = OffsetDateTime::now_utc();
        let session = Session::from_grant(pair("AT", "RT", 3600), User::new("u1", "a@b.com"), issued_at);

        assert_eq!(session.status_at(issued_at, GRACE), SessionStatus::Valid);
        assert_eq!(
            session.status_at(issued_at + time::Duration::seconds(3539), GRACE),
            SessionStatus::Valid
        );
        assert_eq!(
            session.status_at(issued_at + time::Duration::seconds(3540), GRACE),
            SessionStatus::Expiring
        );
        assert_eq!(
            session.status_at(issued_at + time::Duration::seconds(3600), GRACE),
            SessionStatus::Expired
        );
    }

    #[test]
    fn zero_lifetime_is_expired_immediately() {
        let issued_at = OffsetDateTime::now_utc();
        let session = Session::from_grant(pair("AT", "RT", 0), User::new("u1", "a@b.com"), issued_at);
        assert_eq!(session.status_at(issued_at, GRACE), SessionStatus::Expired);
        assert!(!session.is_active_at(issued_at));
    }

    #[test]
    fn debug_hides_tokens() {
        let session = session_aged("RT-secret", 3600, Duration::ZERO);
        let debug = format!("{session:?}");
        assert!(!debug.contains("RT-secret"));
        assert!(!debug.contains("AT-old"));
    }

    #[test]
    fn serde_roundtrip_keeps_expiry() {
        let session = session_aged("RT1", 3600, Duration::ZERO);
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expires_at().unix_timestamp(), session.expires_at().unix_timestamp());
        assert_eq!(back.refresh_token(), "RT1");
    }
}
