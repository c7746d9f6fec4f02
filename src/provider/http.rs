use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde_json::json;
use url::Url;

use super::{
    IdentityProvider, Registration, TokenGrant, UserUpdate, parse_registration, parse_token_grant,
    parse_user,
};
use crate::error::{AuthError, Error};
use crate::report;
use crate::types::User;
use crate::validate::ValidatedCredentials;

const API_KEY_HEADER: &str = "apikey";

/// Identity provider endpoints and API key.
///
/// Endpoint URLs are derived from the base URL; each can be overridden.
///
/// ```rust,ignore
/// use clientdesk_auth::ProviderConfig;
///
/// let config = ProviderConfig::new("https://id.example.com".parse()?, "anon-key")?
///     .with_token_url("https://id.example.com/auth/v1/token".parse()?);
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub struct ProviderConfig {
    pub(crate) api_key: String,
    pub(crate) token_url: Url,
    pub(crate) signup_url: Url,
    pub(crate) logout_url: Url,
    pub(crate) user_url: Url,
    pub(crate) timeout: Duration,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("token_url", &self.token_url.as_str())
            .field("signup_url", &self.signup_url.as_str())
            .field("logout_url", &self.logout_url.as_str())
            .field("user_url", &self.user_url.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    /// Create a configuration rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_url` cannot be a base for endpoint paths.
    pub fn new(base_url: Url, api_key: impl Into<String>) -> Result<Self, Error> {
        let mut base = base_url;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| Error::Config(format!("provider URL {base}: {e}")))
        };

        Ok(Self {
            api_key: api_key.into(),
            token_url: join("auth/token")?,
            signup_url: join("auth/signup")?,
            logout_url: join("auth/logout")?,
            user_url: join("auth/user")?,
            timeout: Duration::from_secs(10),
        })
    }

    /// Override the token endpoint (password and refresh grants).
    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    /// Override the sign-up endpoint.
    #[must_use]
    pub fn with_signup_url(mut self, url: Url) -> Self {
        self.signup_url = url;
        self
    }

    /// Override the server-side sign-out endpoint.
    #[must_use]
    pub fn with_logout_url(mut self, url: Url) -> Self {
        self.logout_url = url;
        self
    }

    /// Override the user endpoint (fetch and update).
    #[must_use]
    pub fn with_user_url(mut self, url: Url) -> Self {
        self.user_url = url;
        self
    }

    /// Per-request timeout (default 10s). A timeout is a `NetworkError`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Token endpoint URL.
    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Sign-up endpoint URL.
    #[must_use]
    pub fn signup_url(&self) -> &Url {
        &self.signup_url
    }

    /// Sign-out endpoint URL.
    #[must_use]
    pub fn logout_url(&self) -> &Url {
        &self.logout_url
    }

    /// User endpoint URL.
    #[must_use]
    pub fn user_url(&self) -> &Url {
        &self.user_url
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// [`IdentityProvider`] over the provider's HTTP API.
pub struct HttpProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Create a provider client with a default HTTP client.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// The endpoint configuration in use.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn grant_url(&self, grant_type: &str) -> Url {
        let mut url = self.config.token_url.clone();
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .timeout(self.config.timeout)
            .header(API_KEY_HEADER, &self.config.api_key)
    }

    /// Sends the request once and returns the body of a 2xx response.
    /// Non-success statuses are normalized into an [`AuthError`].
    async fn send(
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<String, AuthError> {
        let response = request
            .send()
            .await
            .map_err(|e| report::network(operation, &e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response
            .text()
            .await
            .map_err(|e| report::network(operation, &e))?;

        if status.is_success() {
            return Ok(body);
        }
        tracing::debug!(operation, status = status.as_u16(), "Provider returned an error");
        Err(report::normalize(status.as_u16(), &body, retry_after.as_deref()))
    }
}

impl IdentityProvider for HttpProvider {
    async fn issue_from_password(
        &self,
        credentials: &ValidatedCredentials,
    ) -> Result<TokenGrant, AuthError> {
        const OP: &str = "password grant";
        let body = json!({
            "email": credentials.email().as_str(),
            "password": credentials.password().expose(),
        });
        let request = self
            .request(reqwest::Method::POST, self.grant_url("password"))
            .json(&body);
        let text = Self::send(request, OP).await?;
        parse_token_grant(OP, &text)
    }

    async fn issue_from_registration(
        &self,
        credentials: &ValidatedCredentials,
        full_name: Option<&str>,
    ) -> Result<Registration, AuthError> {
        const OP: &str = "signup";
        let mut body = json!({
            "email": credentials.email().as_str(),
            "password": credentials.password().expose(),
        });
        if let Some(name) = full_name {
            body["data"] = json!({ "full_name": name });
        }
        let request = self
            .request(reqwest::Method::POST, self.config.signup_url.clone())
            .json(&body);
        let text = Self::send(request, OP).await?;
        parse_registration(OP, &text)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        const OP: &str = "refresh grant";
        let request = self
            .request(reqwest::Method::POST, self.grant_url("refresh_token"))
            .json(&json!({ "refresh_token": refresh_token }));
        let text = Self::send(request, OP).await?;
        parse_token_grant(OP, &text)
    }

    async fn revoke(&self, access_token: &str) -> Result<(), AuthError> {
        let request = self
            .request(reqwest::Method::POST, self.config.logout_url.clone())
            .bearer_auth(access_token);
        Self::send(request, "logout").await.map(|_| ())
    }

    async fn fetch_user(&self, access_token: &str) -> Result<User, AuthError> {
        const OP: &str = "user fetch";
        let request = self
            .request(reqwest::Method::GET, self.config.user_url.clone())
            .bearer_auth(access_token);
        let text = Self::send(request, OP).await?;
        parse_user(OP, &text)
    }

    async fn update_user(&self, access_token: &str, update: &UserUpdate) -> Result<User, AuthError> {
        const OP: &str = "user update";
        let mut body = json!({});
        if let Some(password) = &update.password {
            body["password"] = json!(password.expose());
        }
        if let Some(name) = &update.full_name {
            body["data"] = json!({ "full_name": name });
        }
        let request = self
            .request(reqwest::Method::PUT, self.config.user_url.clone())
            .bearer_auth(access_token)
            .json(&body);
        let text = Self::send(request, OP).await?;
        parse_user(OP, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig::new("https://id.example.com".parse().unwrap(), "anon-key").unwrap()
    }

    #[test]
    fn endpoints_derive_from_base() {
        let config = config();
        assert_eq!(config.token_url().as_str(), "https://id.example.com/auth/token");
        assert_eq!(config.signup_url().as_str(), "https://id.example.com/auth/signup");
        assert_eq!(config.logout_url().as_str(), "https://id.example.com/auth/logout");
        assert_eq!(config.user_url().as_str(), "https://id.example.com/auth/user");
    }

    #[test]
    fn base_path_is_kept() {
        let config =
            ProviderConfig::new("https://id.example.com/v1".parse().unwrap(), "k").unwrap();
        assert_eq!(config.token_url().as_str(), "https://id.example.com/v1/auth/token");
    }

    #[test]
    fn overrides_apply() {
        let config = config()
            .with_token_url("https://other.example.com/token".parse().unwrap())
            .with_timeout(Duration::from_secs(3));
        assert_eq!(config.token_url().as_str(), "https://other.example.com/token");
        assert_eq!(config.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn grant_url_carries_grant_type() {
        let provider = HttpProvider::new(config());
        assert_eq!(
            provider.grant_url("refresh_token").as_str(),
            "https://id.example.com/auth/token?grant_type=refresh_token"
        );
    }

    #[test]
    fn debug_hides_api_key() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("anon-key"));
    }
}
