use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// Crate-level error returned by every caller-facing operation.
///
/// `Clone` so that coalesced refreshes can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Credential shape rejected locally; the provider was never contacted.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The provider (or the transport to it) failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// No session is held by this client context.
    #[error("Not authenticated")]
    NotAuthenticated,
    /// The session was signed out or replaced while a refresh was in flight.
    #[error("Session superseded during refresh")]
    Superseded,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Session persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// The provider error, if this failure came from the provider.
    #[must_use]
    pub fn as_auth(&self) -> Option<&AuthError> {
        match self {
            Self::Auth(e) => Some(e),
            _ => None,
        }
    }
}

/// Stable error taxonomy for provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AuthErrorKind {
    InvalidCredentials,
    EmailNotConfirmed,
    UserNotFound,
    RateLimited,
    /// Malformed provider response (contract drift, not a credential problem).
    ProtocolError,
    /// Transport failure before a provider answer was received.
    NetworkError,
    Unknown,
}

impl AuthErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "InvalidCredentials",
            Self::EmailNotConfirmed => "EmailNotConfirmed",
            Self::UserNotFound => "UserNotFound",
            Self::RateLimited => "RateLimited",
            Self::ProtocolError => "ProtocolError",
            Self::NetworkError => "NetworkError",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether a later attempt with the same input may succeed.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NetworkError | Self::RateLimited)
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized provider failure.
///
/// Serializes as `{"error": "<kind>", "error_description": ..., "error_code": ...}`
/// so UIs can render every failure path the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthError {
    error: AuthErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip)]
    retry_after: Option<Duration>,
}

impl AuthError {
    #[must_use]
    pub fn new(kind: AuthErrorKind) -> Self {
        Self {
            error: kind,
            error_description: None,
            error_code: None,
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    #[must_use]
    pub fn kind(&self) -> AuthErrorKind {
        self.error
    }

    /// Original provider message, kept verbatim for diagnostics.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.error_description.as_deref()
    }

    /// Provider-specific error code, if the provider sent one.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// Back-off interval for `RateLimited` errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(desc) => write!(f, "{}: {desc}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for AuthError {}
