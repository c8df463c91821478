/// Transport-layer error classes. Everything above this layer matches on the
/// class, never on provider-specific payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

const QUOTA_MARKERS: &[&str] = &[
    "credit balance too low",
    "insufficient_quota",
    "billing",
    "quota exceeded",
];

impl ProviderError {
    /// Map an HTTP failure onto an error class. 429 is a rate limit unless
    /// the body names a billing condition; billing markers always classify
    /// as quota regardless of status.
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        let lower = body.to_lowercase();
        if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
            return ProviderError::QuotaExhausted(truncate(&body, 300));
        }
        if status == 429 {
            let retry_after_ms = retry_after
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return ProviderError::RateLimited { retry_after_ms };
        }
        if status == 402 {
            return ProviderError::QuotaExhausted(truncate(&body, 300));
        }
        if status >= 500 {
            return ProviderError::Transport(format!("{status}: {}", truncate(&body, 300)));
        }
        ProviderError::Http { status, body: truncate(&body, 300) }
    }

    /// Whether the retry policy may attempt this call again. Quota and
    /// client-side HTTP errors fail fast; a timeout gets exactly one retry,
    /// enforced by the policy itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout { seconds: 0 }
        } else if e.is_decode() {
            ProviderError::Deserialization(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_rate_limit() {
        let e = ProviderError::from_http(429, "slow down".into(), Some("3"));
        match e {
            ProviderError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, 3000),
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn billing_body_overrides_status() {
        let e = ProviderError::from_http(429, "Your credit balance too low".into(), None);
        assert!(matches!(e, ProviderError::QuotaExhausted(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn server_errors_are_transport() {
        let e = ProviderError::from_http(503, "unavailable".into(), None);
        assert!(matches!(e, ProviderError::Transport(_)));
        assert!(e.is_retryable());
    }

    #[test]
    fn client_errors_fail_fast() {
        let e = ProviderError::from_http(400, "bad request".into(), None);
        assert!(!e.is_retryable());
    }
}
