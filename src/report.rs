//! Normalizes provider failures into the stable [`AuthErrorKind`] taxonomy.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthError, AuthErrorKind};

/// Back-off used when a rate-limited response carries no `Retry-After`.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Union of the error body shapes the provider is known to send:
/// OAuth-style `{error, error_description}`, `{code, error_code, msg}`
/// and bare `{message}`.
#[derive(Debug, Default, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ProviderErrorBody {
    fn message(&self) -> Option<&str> {
        self.error_description
            .as_deref()
            .or(self.msg.as_deref())
            .or(self.message.as_deref())
    }
}

/// Maps a non-success provider response onto an [`AuthError`].
///
/// `retry_after` is the raw `Retry-After` header value, if any. The provider
/// message is kept verbatim in `error_description`; unrecognized errors
/// become [`AuthErrorKind::Unknown`].
#[must_use]
pub fn normalize(status: u16, body: &str, retry_after: Option<&str>) -> AuthError {
    let parsed = serde_json::from_str::<ProviderErrorBody>(body).ok();
    let (parsed, raw_message) = match parsed {
        Some(p) => (p, None),
        None => {
            let trimmed = body.trim();
            (
                ProviderErrorBody::default(),
                (!trimmed.is_empty()).then(|| trimmed.to_owned()),
            )
        }
    };

    let error = parsed.error.as_deref().unwrap_or_default();
    let code = parsed.error_code.as_deref().unwrap_or_default();
    let message = parsed.message().map(str::to_owned).or(raw_message);
    let lowered = message.as_deref().unwrap_or_default().to_ascii_lowercase();

    let kind = if status == 429 || (code.starts_with("over_") && code.ends_with("_rate_limit")) {
        AuthErrorKind::RateLimited
    } else if code == "email_not_confirmed" || lowered.contains("email not confirmed") {
        AuthErrorKind::EmailNotConfirmed
    } else if code == "user_not_found" || status == 404 {
        AuthErrorKind::UserNotFound
    } else if error == "invalid_grant"
        || code == "invalid_credentials"
        || code.starts_with("refresh_token_")
        || code.starts_with("session_")
        || status == 401
    {
        AuthErrorKind::InvalidCredentials
    } else {
        AuthErrorKind::Unknown
    };

    let mut normalized = AuthError::new(kind);
    let description = match (message, parsed.error.as_deref()) {
        (Some(m), _) => Some(m),
        (None, Some(e)) => Some(e.to_owned()),
        (None, None) if kind == AuthErrorKind::Unknown => Some(format!("HTTP {status}")),
        (None, None) => None,
    };
    if let Some(description) = description {
        normalized = normalized.with_description(description);
    }
    if let Some(code) = parsed.error_code.or(parsed.error) {
        normalized = normalized.with_code(code);
    }
    if kind == AuthErrorKind::RateLimited {
        let wait = retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(DEFAULT_RATE_LIMIT_BACKOFF, Duration::from_secs);
        normalized = normalized.with_retry_after(wait);
    }

    tracing::debug!(status, kind = %kind, "Provider error normalized");
    normalized
}

/// Contract violation by the provider (missing/extra fields, bad token type).
///
/// Emits an error-level diagnostic since it signals provider/client drift.
#[must_use]
pub fn protocol(operation: &'static str, detail: impl Into<String>) -> AuthError {
    let detail = detail.into();
    tracing::error!(operation, detail = %detail, "Provider response violated the token contract");
    AuthError::new(AuthErrorKind::ProtocolError).with_description(detail)
}

/// Transport failure before a provider answer was received.
#[cfg(feature = "http")]
#[must_use]
pub fn network(operation: &'static str, err: &reqwest::Error) -> AuthError {
    tracing::warn!(operation, error = %err, "Provider request failed");
    AuthError::new(AuthErrorKind::NetworkError).with_description(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_invalid_credentials() {
        let err = normalize(400, r#"{"error":"invalid_grant"}"#, None);
        assert_eq!(err.kind(), AuthErrorKind::InvalidCredentials);
        assert_eq!(err.code(), Some("invalid_grant"));
        assert_eq!(err.description(), Some("invalid_grant"));
    }

    #[test]
    fn oauth_style_body_keeps_description() {
        let err = normalize(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
            None,
        );
        assert_eq!(err.kind(), AuthErrorKind::InvalidCredentials);
        assert_eq!(err.description(), Some("Invalid login credentials"));
    }

    #[test]
    fn email_not_confirmed_by_code_or_message() {
        let by_code = normalize(
            400,
            r#"{"code":400,"error_code":"email_not_confirmed","msg":"Email not confirmed"}"#,
            None,
        );
        assert_eq!(by_code.kind(), AuthErrorKind::EmailNotConfirmed);

        let by_message = normalize(
            400,
            r#"{"error":"invalid_grant","error_description":"Email not confirmed"}"#,
            None,
        );
        assert_eq!(by_message.kind(), AuthErrorKind::EmailNotConfirmed);
    }

    #[test]
    fn user_not_found() {
        let err = normalize(404, r#"{"message":"User not found"}"#, None);
        assert_eq!(err.kind(), AuthErrorKind::UserNotFound);
        assert_eq!(err.description(), Some("User not found"));

        let err = normalize(400, r#"{"error_code":"user_not_found","msg":"gone"}"#, None);
        assert_eq!(err.kind(), AuthErrorKind::UserNotFound);
    }

    #[test]
    fn rejected_refresh_tokens_are_invalid_credentials() {
        for code in ["refresh_token_not_found", "refresh_token_already_used", "session_expired"] {
            let body = format!(r#"{{"code":400,"error_code":"{code}","msg":"nope"}}"#);
            assert_eq!(normalize(400, &body, None).kind(), AuthErrorKind::InvalidCredentials);
        }
    }

    #[test]
    fn rate_limit_uses_header_then_default() {
        let err = normalize(429, r#"{"message":"slow down"}"#, Some("12"));
        assert_eq!(err.kind(), AuthErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));

        let err = normalize(400, r#"{"error_code":"over_request_rate_limit"}"#, None);
        assert_eq!(err.kind(), AuthErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(DEFAULT_RATE_LIMIT_BACKOFF));

        let err = normalize(429, "", Some("soon"));
        assert_eq!(err.retry_after(), Some(DEFAULT_RATE_LIMIT_BACKOFF));
    }

    #[test]
    fn unrecognized_errors_are_unknown_and_verbatim() {
        let err = normalize(
            422,
            r#"{"code":422,"error_code":"user_already_exists","msg":"User already registered"}"#,
            None,
        );
        assert_eq!(err.kind(), AuthErrorKind::Unknown);
        assert_eq!(err.description(), Some("User already registered"));
        assert_eq!(err.code(), Some("user_already_exists"));
    }

    #[test]
    fn non_json_body_is_preserved() {
        let err = normalize(502, "<html>Bad Gateway</html>", None);
        assert_eq!(err.kind(), AuthErrorKind::Unknown);
        assert_eq!(err.description(), Some("<html>Bad Gateway</html>"));
    }

    #[test]
    fn empty_body_still_describes_status() {
        let err = normalize(500, "", None);
        assert_eq!(err.kind(), AuthErrorKind::Unknown);
        assert_eq!(err.description(), Some("HTTP 500"));
    }

    #[test]
    fn protocol_error_carries_detail() {
        let err = protocol("password grant", "missing field `refresh_token`");
        assert_eq!(err.kind(), AuthErrorKind::ProtocolError);
        assert_eq!(err.description(), Some("missing field `refresh_token`"));
    }
}
