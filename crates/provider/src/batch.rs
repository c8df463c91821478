use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::retry::{chat_with_retry, RetryPolicy};
use crate::types::{ChatRequest, ChatResponse};
use crate::{Provider, ProviderError};

#[derive(Debug, Clone, Serialize)]
pub struct BatchTelemetry {
    pub batch_size: usize,
    pub mode: &'static str,
    pub per_item_latency_ms: Vec<u64>,
}

/// Ordered batch primitive: `results[i]` always corresponds to
/// `requests[i]`, regardless of completion order. Fan-out is bounded by the
/// semaphore; per-item failures are returned in place, never dropped.
pub async fn chat_batch(
    provider: Arc<dyn Provider>,
    requests: Vec<ChatRequest>,
    policy: &RetryPolicy,
    max_concurrency: usize,
) -> (Vec<Result<ChatResponse, ProviderError>>, BatchTelemetry) {
    let n = requests.len();
    if n == 0 {
        return (
            Vec::new(),
            BatchTelemetry { batch_size: 0, mode: "empty", per_item_latency_ms: Vec::new() },
        );
    }

    let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let tasks = requests.into_iter().map(|req| {
        let provider = Arc::clone(&provider);
        let sem = Arc::clone(&sem);
        let policy = policy.clone();
        async move {
            // Semaphore is never closed while we hold an Arc to it.
            let _permit = sem.acquire().await.expect("semaphore closed");
            chat_with_retry(provider.as_ref(), &req, &policy).await
        }
    });

    // join_all preserves input order, which is the mapping guarantee.
    let results = futures::future::join_all(tasks).await;

    let per_item_latency_ms = results
        .iter()
        .map(|r| r.as_ref().map(|resp| resp.latency_ms).unwrap_or(0))
        .collect();

    (
        results,
        BatchTelemetry {
            batch_size: n,
            mode: if n == 1 { "single" } else { "concurrent" },
            per_item_latency_ms,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Echoes the user payload back after a delay inversely proportional to
    /// the index, so completion order is the reverse of submission order.
    struct EchoProvider;

    #[async_trait::async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let idx: u64 = request.user.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(idx * 2))).await;
            Ok(ChatResponse {
                content: request.user.clone(),
                usage: None,
                latency_ms: 1,
            })
        }
    }

    #[tokio::test]
    async fn order_is_preserved_under_concurrency() {
        let requests: Vec<ChatRequest> = (0..8)
            .map(|i| ChatRequest::new("m", "sys", i.to_string()))
            .collect();
        let (results, telemetry) =
            chat_batch(Arc::new(EchoProvider), requests, &RetryPolicy::default(), 4).await;

        assert_eq!(telemetry.batch_size, 8);
        assert_eq!(telemetry.mode, "concurrent");
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.as_ref().unwrap().content, i.to_string());
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let (results, telemetry) =
            chat_batch(Arc::new(EchoProvider), Vec::new(), &RetryPolicy::default(), 4).await;
        assert!(results.is_empty());
        assert_eq!(telemetry.mode, "empty");
    }
}
