use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
#[cfg(feature = "http")]
use crate::provider::ProviderConfig;
use crate::refresh::DEFAULT_GRACE_WINDOW;
use crate::retry::RetryPolicy;

/// Client-side settings shared by every provider implementation.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub(crate) grace_window: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) session_file: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            grace_window: DEFAULT_GRACE_WINDOW,
            retry: RetryPolicy::default(),
            session_file: None,
        }
    }
}

impl ClientSettings {
    /// How long before expiry a session is refreshed (default 60s).
    #[must_use]
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }

    /// Retry policy for provider calls (default: one network retry).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persist the session to this JSON file.
    #[must_use]
    pub fn with_session_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_file = Some(path.into());
        self
    }

    /// Refresh margin before expiry.
    #[must_use]
    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Retry policy for provider calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Session file, if the session is persisted.
    #[must_use]
    pub fn session_file(&self) -> Option<&PathBuf> {
        self.session_file.as_ref()
    }
}

/// Full configuration for an HTTP-backed [`AuthClient`](crate::AuthClient).
///
/// Use [`from_env()`](AuthConfig::from_env) for convention-based setup,
/// or [`new()`](AuthConfig::new) with `with_*` methods for full control.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub(crate) provider: ProviderConfig,
    pub(crate) settings: ClientSettings,
}

#[cfg(feature = "http")]
impl AuthConfig {
    /// Create config for `provider` with default client settings.
    #[must_use]
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            settings: ClientSettings::default(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `AUTH_PROVIDER_URL`: identity provider base URL
    /// - `AUTH_API_KEY`: provider API key
    ///
    /// # Optional env vars
    /// - `AUTH_REFRESH_GRACE_SECS`: refresh this many seconds before expiry
    /// - `AUTH_HTTP_TIMEOUT_SECS`: per-request timeout
    /// - `AUTH_SESSION_FILE`: persist the session to this JSON file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required keys are missing or values are invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let base_url: url::Url = lookup("AUTH_PROVIDER_URL")
            .ok_or_else(|| Error::Config("AUTH_PROVIDER_URL is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("AUTH_PROVIDER_URL: {e}")))?;
        let api_key = lookup("AUTH_API_KEY")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("AUTH_API_KEY is required".into()))?;

        let mut provider = ProviderConfig::new(base_url, api_key)?;
        if let Some(secs) = lookup("AUTH_HTTP_TIMEOUT_SECS") {
            provider = provider.with_timeout(Duration::from_secs(parse_secs(
                "AUTH_HTTP_TIMEOUT_SECS",
                &secs,
            )?));
        }

        let mut config = Self::new(provider);
        if let Some(secs) = lookup("AUTH_REFRESH_GRACE_SECS") {
            config.settings = config.settings.with_grace_window(Duration::from_secs(parse_secs(
                "AUTH_REFRESH_GRACE_SECS",
                &secs,
            )?));
        }
        if let Some(path) = lookup("AUTH_SESSION_FILE").filter(|p| !p.is_empty()) {
            config.settings = config.settings.with_session_file(path);
        }
        Ok(config)
    }

    /// Replace the client settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Provider endpoints and API key.
    #[must_use]
    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    /// Client-side settings.
    #[must_use]
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
}

#[cfg(feature = "http")]
fn parse_secs(key: &str, raw: &str) -> Result<u64, Error> {
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

#[cfg(all(test, feature = "http"))]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn requires_provider_url() {
        let err = AuthConfig::from_lookup(lookup(&[("AUTH_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("AUTH_PROVIDER_URL")));
    }

    #[test]
    fn requires_api_key() {
        let err = AuthConfig::from_lookup(lookup(&[("AUTH_PROVIDER_URL", "https://id.example.com")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("AUTH_API_KEY")));
    }

    #[test]
    fn rejects_bad_url() {
        let err = AuthConfig::from_lookup(lookup(&[
            ("AUTH_PROVIDER_URL", "not a url"),
            ("AUTH_API_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn reads_optional_values() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("AUTH_PROVIDER_URL", "https://id.example.com"),
            ("AUTH_API_KEY", "k"),
            ("AUTH_REFRESH_GRACE_SECS", "120"),
            ("AUTH_HTTP_TIMEOUT_SECS", " 4 "),
            ("AUTH_SESSION_FILE", "/tmp/session.json"),
        ]))
        .unwrap();

        assert_eq!(config.settings().grace_window(), Duration::from_secs(120));
        assert_eq!(config.provider().timeout(), Duration::from_secs(4));
        assert_eq!(
            config.settings().session_file().map(|p| p.to_string_lossy().into_owned()),
            Some("/tmp/session.json".to_owned())
        );
    }

    #[test]
    fn defaults_without_optional_values() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("AUTH_PROVIDER_URL", "https://id.example.com"),
            ("AUTH_API_KEY", "k"),
        ]))
        .unwrap();
        assert_eq!(config.settings().grace_window(), DEFAULT_GRACE_WINDOW);
        assert!(config.settings().session_file().is_none());
    }

    #[test]
    fn rejects_non_numeric_grace() {
        let err = AuthConfig::from_lookup(lookup(&[
            ("AUTH_PROVIDER_URL", "https://id.example.com"),
            ("AUTH_API_KEY", "k"),
            ("AUTH_REFRESH_GRACE_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("AUTH_REFRESH_GRACE_SECS")));
    }
}
