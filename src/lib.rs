#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
pub mod provider;
pub mod refresh;
pub mod report;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;
pub mod validate;

// Re-exports for convenient access
pub use client::{AuthClient, AuthResponse, LoginRequest, RegisterRequest, UpdateUserRequest};
#[cfg(feature = "http")]
pub use config::AuthConfig;
pub use config::ClientSettings;
pub use error::{AuthError, AuthErrorKind, Error};
#[cfg(feature = "http")]
pub use provider::{HttpProvider, ProviderConfig};
pub use provider::{IdentityProvider, Registration, TokenGrant, UserUpdate};
pub use refresh::{AutoRefresh, DEFAULT_GRACE_WINDOW, SessionRefresher};
pub use retry::RetryPolicy;
pub use session::{Session, SessionStatus};
pub use store::{JsonFilePersistence, SessionPersistence, SessionStore};
pub use types::{Email, Password, TokenPair, TokenType, User, UserId};
pub use validate::{Credentials, Flow, ValidatedCredentials, ValidationError, validate};
