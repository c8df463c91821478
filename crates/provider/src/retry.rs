use rand::Rng;
use std::time::Duration;

use crate::types::{ChatRequest, ChatResponse};
use crate::{Provider, ProviderError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt` plus up to 25% jitter. Rate limits honor the
    /// server's retry-after when it is longer.
    fn backoff(&self, attempt: u32, rate_limit_hint_ms: Option<u64>) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(6));
        let jitter = rand::rng().random_range(0..=exp / 4 + 1);
        let ms = exp + jitter;
        Duration::from_millis(ms.max(rate_limit_hint_ms.unwrap_or(0)))
    }
}

/// One completion with per-call timeout and class-aware retries: rate limits
/// and transport errors back off and retry; timeouts get exactly one retry;
/// quota and other client errors surface immediately.
pub async fn chat_with_retry(
    provider: &dyn Provider,
    request: &ChatRequest,
    policy: &RetryPolicy,
) -> Result<ChatResponse, ProviderError> {
    let mut timeout_retried = false;

    for attempt in 0..policy.max_attempts {
        let result = tokio::time::timeout(policy.call_timeout, provider.chat(request)).await;

        let err = match result {
            Ok(Ok(resp)) => return Ok(resp),
            Ok(Err(e)) => e,
            Err(_) => ProviderError::Timeout {
                seconds: policy.call_timeout.as_secs(),
            },
        };

        let last_attempt = attempt + 1 >= policy.max_attempts;

        match &err {
            ProviderError::Timeout { .. } => {
                if timeout_retried || last_attempt {
                    return Err(err);
                }
                timeout_retried = true;
                tracing::warn!(provider = provider.name(), "call timed out, retrying once");
            }
            ProviderError::RateLimited { retry_after_ms } => {
                if last_attempt {
                    return Err(err);
                }
                let wait = policy.backoff(attempt, Some(*retry_after_ms));
                tracing::warn!(
                    provider = provider.name(),
                    wait_ms = wait.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::time::sleep(wait).await;
            }
            ProviderError::Transport(msg) => {
                if last_attempt {
                    return Err(err);
                }
                let wait = policy.backoff(attempt, None);
                tracing::warn!(
                    provider = provider.name(),
                    error = %msg,
                    wait_ms = wait.as_millis() as u64,
                    "transport error, backing off"
                );
                tokio::time::sleep(wait).await;
            }
            _ => return Err(err),
        }
    }

    Err(ProviderError::Transport("retry budget exhausted".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
        error_kind: &'static str,
    }

    #[async_trait::async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(match self.error_kind {
                    "rate_limit" => ProviderError::RateLimited { retry_after_ms: 1 },
                    "quota" => ProviderError::QuotaExhausted("billing".into()),
                    _ => ProviderError::Transport("flap".into()),
                });
            }
            Ok(ChatResponse {
                content: "ok".into(),
                usage: None,
                latency_ms: 1,
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let p = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error_kind: "rate_limit",
        };
        let req = ChatRequest::new("m", "s", "u");
        let resp = chat_with_retry(&p, &req, &fast_policy()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn quota_fails_immediately() {
        let p = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error_kind: "quota",
        };
        let req = ChatRequest::new("m", "s", "u");
        let err = chat_with_retry(&p, &req, &fast_policy()).await.unwrap_err();
        assert!(matches!(err, ProviderError::QuotaExhausted(_)));
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_errors_exhaust_budget() {
        let p = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error_kind: "transport",
        };
        let req = ChatRequest::new("m", "s", "u");
        let err = chat_with_retry(&p, &req, &fast_policy()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }
}
