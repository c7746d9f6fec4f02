use std::sync::LazyLock;

use regex::Regex;

use crate::types::{Email, Password};

/// Minimum password length for account creation and password changes.
pub const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$",
    )
    .expect("email pattern is valid")
});

/// Checks an email address against a dot-atom `local@domain.tld` grammar.
#[must_use]
pub fn is_valid_email(s: &str) -> bool {
    s.len() <= 254 && EMAIL_RE.is_match(s)
}

/// Which flow the credentials are submitted for.
///
/// Login only needs a non-empty password; the provider makes the
/// authoritative check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Login,
    Registration,
    PasswordUpdate,
}

/// Raw credentials as submitted by the caller.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: Password,
}

impl Credentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<Password>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Credentials that passed [`validate`].
#[derive(Debug, Clone)]
pub struct ValidatedCredentials {
    email: Email,
    password: Password,
}

impl ValidatedCredentials {
    #[must_use]
    pub fn email(&self) -> &Email {
        &self.email
    }

    #[must_use]
    pub fn password(&self) -> &Password {
        &self.password
    }
}

/// First violated credential constraint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    field: &'static str,
    reason: String,
}

impl ValidationError {
    #[must_use]
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn field(&self) -> &'static str {
        self.field
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Validates credential shape for the given flow. Pure, no I/O.
///
/// # Errors
///
/// Returns a [`ValidationError`] for the first failing field, email first.
pub fn validate(credentials: Credentials, flow: Flow) -> Result<ValidatedCredentials, ValidationError> {
    let email = Email::try_from(credentials.email)?;
    validate_password(&credentials.password, flow)?;
    Ok(ValidatedCredentials {
        email,
        password: credentials.password,
    })
}

/// Validates a password on its own (e.g. a password change).
///
/// # Errors
///
/// Returns a [`ValidationError`] on `field == "password"`.
pub fn validate_password(password: &Password, flow: Flow) -> Result<(), ValidationError> {
    let len = password.expose().chars().count();
    match flow {
        Flow::Login if len == 0 => Err(ValidationError::new("password", "must not be empty")),
        Flow::Registration | Flow::PasswordUpdate if len < MIN_PASSWORD_LEN => {
            Err(ValidationError::new(
                "password",
                format!("must be at least {MIN_PASSWORD_LEN} characters"),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_emails() {
        assert!(is_valid_email("a@b.com"));
        assert!(is_valid_email("mario.rossi+polizze@agenzia-uno.it"));
        assert!(is_valid_email("o'neil@mail.example.co.uk"));
    }

    #[test]
    fn invalid_emails() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("plain"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("@b.com"));
        assert!(!is_valid_email("a..b@c.com"));
        assert!(!is_valid_email("a@-b.com"));
        assert!(!is_valid_email("a b@c.com"));
        assert!(!is_valid_email("a@b.c"));
    }

    #[test]
    fn login_accepts_short_password() {
        let creds = Credentials::new("a@b.com", "x");
        let validated = validate(creds, Flow::Login).unwrap();
        assert_eq!(validated.email().as_str(), "a@b.com");
        assert_eq!(validated.password().expose(), "x");
    }

    #[test]
    fn login_rejects_empty_password() {
        let err = validate(Credentials::new("a@b.com", ""), Flow::Login).unwrap_err();
        assert_eq!(err.field(), "password");
    }

    #[test]
    fn registration_requires_min_length() {
        let err = validate(Credentials::new("a@b.com", "12345"), Flow::Registration).unwrap_err();
        assert_eq!(err.field(), "password");
        assert!(validate(Credentials::new("a@b.com", "123456"), Flow::Registration).is_ok());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // 6 chars, 12 bytes
        let pw = Password::new("éééééé");
        assert!(validate_password(&pw, Flow::PasswordUpdate).is_ok());
        let pw = Password::new("ééééé");
        assert!(validate_password(&pw, Flow::PasswordUpdate).is_err());
    }

    #[test]
    fn email_checked_before_password() {
        let err = validate(Credentials::new("nope", ""), Flow::Registration).unwrap_err();
        assert_eq!(err.field(), "email");
    }
}
