//! Token issuance contract against the external identity provider.
//!
//! The provider performs the actual credential check and token minting;
//! this module defines the calls the core makes and the response shape it
//! accepts. Responses are parsed strictly at the boundary: a missing field,
//! an unknown field or a non-bearer token type is a
//! [`ProtocolError`](crate::AuthErrorKind::ProtocolError).

#[cfg(feature = "http")]
mod http;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::report;
use crate::types::{Password, TokenPair, TokenType, User};
use crate::validate::ValidatedCredentials;

#[cfg(feature = "http")]
pub use http::{HttpProvider, ProviderConfig};

/// Tokens plus the user they were issued for.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub tokens: TokenPair,
    pub user: User,
}

/// Outcome of a sign-up.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Account created and signed in.
    Issued(TokenGrant),
    /// Account created; tokens are withheld until the email is confirmed.
    PendingConfirmation(User),
}

/// Profile/password change sent to the provider.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub password: Option<Password>,
    pub full_name: Option<String>,
}

/// Identity provider operations used by the session core.
///
/// Every method performs exactly one round trip and never retries;
/// retry policy lives with the caller.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Password grant.
    fn issue_from_password(
        &self,
        credentials: &ValidatedCredentials,
    ) -> impl Future<Output = Result<TokenGrant, AuthError>> + Send;

    /// Account creation.
    fn issue_from_registration(
        &self,
        credentials: &ValidatedCredentials,
        full_name: Option<&str>,
    ) -> impl Future<Output = Result<Registration, AuthError>> + Send;

    /// Refresh-token grant.
    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenGrant, AuthError>> + Send;

    /// Server-side sign-out of the session behind `access_token`.
    fn revoke(&self, access_token: &str) -> impl Future<Output = Result<(), AuthError>> + Send;

    /// Fresh copy of the user behind `access_token`.
    fn fetch_user(&self, access_token: &str)
    -> impl Future<Output = Result<User, AuthError>> + Send;

    /// Applies a profile/password change for the user behind `access_token`.
    fn update_user(
        &self,
        access_token: &str,
        update: &UserUpdate,
    ) -> impl Future<Output = Result<User, AuthError>> + Send;
}

/// Token endpoint success body.
///
/// Only the documented optional extras are tolerated next to the required fields.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: TokenType,
    pub expires_in: u64,
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weak_password: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_refresh_token: Option<String>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(r: TokenResponse) -> Self {
        Self {
            tokens: TokenPair {
                access_token: r.access_token,
                refresh_token: r.refresh_token,
                token_type: r.token_type,
                expires_in: r.expires_in,
            },
            user: r.user,
        }
    }
}

/// Parses a 2xx token endpoint body.
///
/// # Errors
///
/// Returns a `ProtocolError` if the body does not match the contract.
pub(crate) fn parse_token_grant(operation: &'static str, body: &str) -> Result<TokenGrant, AuthError> {
    let response: TokenResponse =
        serde_json::from_str(body).map_err(|e| report::protocol(operation, e.to_string()))?;
    if response.access_token.is_empty() || response.refresh_token.is_empty() {
        return Err(report::protocol(operation, "empty token in response"));
    }
    Ok(response.into())
}

/// Parses a 2xx sign-up body.
///
/// The provider answers with a full token response when the account is
/// usable right away, or with the bare user object when confirmation is
/// pending.
pub(crate) fn parse_registration(operation: &'static str, body: &str) -> Result<Registration, AuthError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| report::protocol(operation, e.to_string()))?;
    if value.get("access_token").is_some() {
        return parse_token_grant(operation, body).map(Registration::Issued);
    }
    let user: User =
        serde_json::from_value(value).map_err(|e| report::protocol(operation, e.to_string()))?;
    Ok(Registration::PendingConfirmation(user))
}

/// Parses a 2xx user endpoint body.
pub(crate) fn parse_user(operation: &'static str, body: &str) -> Result<User, AuthError> {
    serde_json::from_str(body).map_err(|e| report::protocol(operation, e.to_string()))
}
