use std::future::Future;
use std::time::Duration;

use crate::error::{AuthError, AuthErrorKind};

/// Bounded retry policy for provider calls.
///
/// Only `NetworkError` and `RateLimited` are ever retried; every other
/// error is final for the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub network_retries: u32,
    pub network_backoff: Duration,
    /// Rate-limited calls are surfaced to the caller unless this is non-zero.
    pub rate_limit_retries: u32,
    /// Longest `retry_after` the client is willing to sleep through.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_retries: 1,
            network_backoff: Duration::from_millis(250),
            rate_limit_retries: 0,
            max_rate_limit_wait: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            network_retries: 0,
            rate_limit_retries: 0,
            ..Self::default()
        }
    }

    /// How long to wait before attempt `n + 1`, or `None` to give up.
    fn backoff(
        &self,
        err: &AuthError,
        network_attempts: u32,
        rate_limit_attempts: u32,
    ) -> Option<Duration> {
        match err.kind() {
            AuthErrorKind::NetworkError if network_attempts < self.network_retries => {
                Some(self.network_backoff)
            }
            AuthErrorKind::RateLimited if rate_limit_attempts < self.rate_limit_retries => err
                .retry_after()
                .filter(|wait| *wait <= self.max_rate_limit_wait),
            _ => None,
        }
    }

    /// Runs `op` until it succeeds, fails terminally or the budget runs out.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AuthError>>,
    {
        let mut network_attempts = 0;
        let mut rate_limit_attempts = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(wait) = self.backoff(&err, network_attempts, rate_limit_attempts) else {
                return Err(err);
            };
            match err.kind() {
                AuthErrorKind::RateLimited => rate_limit_attempts += 1,
                _ => network_attempts += 1,
            }
            tracing::debug!(
                operation,
                kind = %err.kind(),
                wait_ms = wait.as_millis() as u64,
                "Retrying provider call"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Runs `policy` against an op that fails with `err` on every call and
    /// returns how many times the op ran.
    async fn attempts(policy: RetryPolicy, err: AuthError) -> (u32, AuthError) {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = policy
            .run("test", move || {
                let err = err.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(err)
                }
            })
            .await;
        (calls.load(Ordering::SeqCst), res.unwrap_err())
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_retried_once() {
        let (calls, err) =
            attempts(RetryPolicy::default(), AuthError::new(AuthErrorKind::NetworkError)).await;
        assert_eq!(err.kind(), AuthErrorKind::NetworkError);
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn network_retry_can_succeed() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let res = RetryPolicy::default()
            .run("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AuthError::new(AuthErrorKind::NetworkError))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_not_retried() {
        for kind in [
            AuthErrorKind::InvalidCredentials,
            AuthErrorKind::ProtocolError,
            AuthErrorKind::Unknown,
            AuthErrorKind::EmailNotConfirmed,
        ] {
            let (calls, err) = attempts(RetryPolicy::default(), AuthError::new(kind)).await;
            assert_eq!(err.kind(), kind);
            assert_eq!(calls, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_surfaced_by_default() {
        let limited =
            AuthError::new(AuthErrorKind::RateLimited).with_retry_after(Duration::from_secs(1));
        let (calls, err) = attempts(RetryPolicy::default(), limited).await;
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retried_only_within_wait_budget() {
        let policy = RetryPolicy {
            rate_limit_retries: 1,
            ..RetryPolicy::default()
        };

        let short =
            AuthError::new(AuthErrorKind::RateLimited).with_retry_after(Duration::from_secs(2));
        assert_eq!(attempts(policy, short).await.0, 2);

        let long =
            AuthError::new(AuthErrorKind::RateLimited).with_retry_after(Duration::from_secs(60));
        assert_eq!(attempts(policy, long).await.0, 1);
    }

    #[tokio::test]
    async fn none_policy_never_retries() {
        let (calls, _) =
            attempts(RetryPolicy::none(), AuthError::new(AuthErrorKind::NetworkError)).await;
        assert_eq!(calls, 1);
    }
}
