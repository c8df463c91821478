use std::time::Duration;

use verdex_provider::retry::{chat_with_retry, RetryPolicy};
use verdex_provider::{ChatRequest, Provider};

use crate::invariants::{parse_category_items, spec_hash, Category, InvariantSet};
use crate::judges::recover_json;
use crate::prompt_guard;
use crate::VerifyError;

/// Stable extraction prompt: schema, category directive and one few-shot
/// example per category. Kept in the system message for provider caching.
const EXTRACTION_PROMPT: &str = r#"You extract verifiable requirements from a software specification.

Produce STRICT JSON with exactly these three keys, each a non-empty list:
{
  "security": [{"id": 1, "desc": "<requirement>", "severity": "critical|high|medium|low"}],
  "functionality": [{"id": 1, "desc": "<requirement>", "severity": "critical|high|medium|low"}],
  "style": [{"id": 1, "desc": "<requirement>", "severity": "critical|high|medium|low"}]
}

Rules:
- Each entry is ONE atomic, testable requirement under 500 characters.
- Cover ALL THREE categories. Derive implicit requirements when the text is
  silent on a category (e.g. input validation for security, naming and
  documentation for style).
- IDs are integers starting at 1 within each category.

Examples of good entries:
- security: {"id": 1, "desc": "User-supplied strings must never reach eval() or exec()", "severity": "critical"}
- functionality: {"id": 1, "desc": "The parser accepts UTF-8 input of any length and reports line numbers in errors", "severity": "high"}
- style: {"id": 1, "desc": "Public functions carry docstrings describing parameters and return values", "severity": "low"}

Respond with the JSON object only."#;

pub struct Extractor<'a> {
    provider: &'a dyn Provider,
    model_id: String,
    policy: RetryPolicy,
    min_per_category: usize,
    max_attempts: u32,
}

impl<'a> Extractor<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        model_id: impl Into<String>,
        min_per_category: usize,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            policy: RetryPolicy {
                max_attempts: max_attempts.max(1),
                base_backoff: backoff,
                call_timeout: Duration::from_secs(60),
            },
            min_per_category,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Turn spec prose into a categorized invariant set. Invalid JSON burns
    /// an attempt; a category still under its minimum gets one targeted
    /// clarification per remaining attempt, merged by appending.
    pub async fn extract(&self, spec_text: &str) -> Result<InvariantSet, VerifyError> {
        let mut set: Option<InvariantSet> = None;

        for attempt in 0..self.max_attempts {
            match self.request_full(spec_text).await {
                Ok(parsed) => {
                    set = Some(parsed);
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "extraction attempt failed");
                    if attempt + 1 == self.max_attempts {
                        return Err(VerifyError::ExtractionFailed(e));
                    }
                }
            }
        }

        let mut set = set.expect("loop either sets or returns");

        // Coverage pass: re-prompt naming only the categories that came up
        // short, then renumber the merged lists.
        for _ in 0..self.max_attempts {
            let missing = set.missing_categories(self.min_per_category);
            if missing.is_empty() {
                break;
            }
            tracing::info!(?missing, "re-prompting for missing categories");
            match self.request_categories(spec_text, &missing, &set).await {
                Ok(value) => {
                    for category in &missing {
                        let items = parse_category_items(&value[category.to_string()]);
                        if !items.is_empty() {
                            set.merge_category(*category, items);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "clarification attempt failed");
                }
            }
        }

        // After the clarification budget, a still-empty category is fatal;
        // below-minimum but non-empty is tolerated.
        let missing = set.missing_categories(1);
        if !missing.is_empty() {
            return Err(VerifyError::ExtractionFailed(format!(
                "categories still empty after clarification: {}",
                missing
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        set.renumber();
        set.spec_sha256 = spec_hash(spec_text);
        tracing::info!(
            security = set.security.len(),
            functionality = set.functionality.len(),
            style = set.style.len(),
            "extraction complete"
        );
        Ok(set)
    }

    async fn request_full(&self, spec_text: &str) -> Result<InvariantSet, String> {
        let request = ChatRequest::new(
            self.model_id.clone(),
            EXTRACTION_PROMPT.to_string(),
            prompt_guard::bracket_data("SPECIFICATION", spec_text),
        )
        .with_temperature(0.0);

        let response = chat_with_retry(self.provider, &request, &self.policy)
            .await
            .map_err(|e| e.to_string())?;

        let value = recover_json(&response.content)
            .ok_or_else(|| "response is not valid JSON".to_string())?;

        let mut set = InvariantSet {
            security: parse_category_items(&value["security"]),
            functionality: parse_category_items(&value["functionality"]),
            style: parse_category_items(&value["style"]),
            spec_sha256: String::new(),
        };
        set.renumber();
        Ok(set)
    }

    async fn request_categories(
        &self,
        spec_text: &str,
        missing: &[Category],
        current: &InvariantSet,
    ) -> Result<serde_json::Value, String> {
        let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
        let directive = format!(
            "The previous extraction covered some categories sufficiently. Now produce \
             ONLY these categories, with at least {} entries each: {}. Use the same JSON \
             shape, containing only those keys. Current counts: security={}, \
             functionality={}, style={}.",
            self.min_per_category,
            names.join(", "),
            current.security.len(),
            current.functionality.len(),
            current.style.len(),
        );

        let request = ChatRequest::new(
            self.model_id.clone(),
            format!("{EXTRACTION_PROMPT}\n\n{directive}"),
            prompt_guard::bracket_data("SPECIFICATION", spec_text),
        )
        .with_temperature(0.0);

        let response = chat_with_retry(self.provider, &request, &self.policy)
            .await
            .map_err(|e| e.to_string())?;

        recover_json(&response.content).ok_or_else(|| "clarification is not valid JSON".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use verdex_provider::{ChatResponse, ProviderError};

    /// Returns queued responses in order; repeats the last one when empty.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<String>>,
        last: String,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<&str>) -> Self {
            let mut queue: VecDeque<String> =
                responses.iter().map(|s| s.to_string()).collect();
            let last = queue.back().cloned().unwrap_or_default();
            if let Some(back) = queue.back() {
                if back.is_empty() {
                    queue.pop_back();
                }
            }
            Self {
                responses: Mutex::new(queue),
                last,
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.last.clone());
            Ok(ChatResponse {
                content: next,
                usage: None,
                latency_ms: 1,
            })
        }
    }

    fn full_response() -> String {
        serde_json::json!({
            "security": [
                {"id": 1, "desc": "no eval on user input", "severity": "critical"},
                {"id": 2, "desc": "no hard-coded secrets", "severity": "high"},
                {"id": 3, "desc": "validate all file paths", "severity": "high"},
            ],
            "functionality": [
                {"id": 1, "desc": "parses the config file", "severity": "high"},
                {"id": 2, "desc": "reports errors with line numbers", "severity": "medium"},
                {"id": 3, "desc": "supports both diff and full modes", "severity": "medium"},
            ],
            "style": [
                {"id": 1, "desc": "public functions documented", "severity": "low"},
                {"id": 2, "desc": "consistent naming", "severity": "low"},
                {"id": 3, "desc": "no dead code", "severity": "low"},
            ],
        })
        .to_string()
    }

    fn extractor(provider: &ScriptedProvider) -> Extractor<'_> {
        Extractor::new(provider, "mock-model", 3, 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn extracts_all_three_categories() {
        let provider = ScriptedProvider::new(vec![&full_response()]);
        let set = extractor(&provider).extract("the spec").await.unwrap();
        assert_eq!(set.security.len(), 3);
        assert_eq!(set.functionality.len(), 3);
        assert_eq!(set.style.len(), 3);
        assert_eq!(set.spec_sha256, spec_hash("the spec"));
        // IDs are renumbered 1..=n per category
        assert_eq!(
            set.security.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn accepts_fenced_json() {
        let fenced = format!("Sure, here you go:\n```json\n{}\n```", full_response());
        let provider = ScriptedProvider::new(vec![&fenced]);
        let set = extractor(&provider).extract("spec").await.unwrap();
        assert_eq!(set.total(), 9);
    }

    #[tokio::test]
    async fn clarifies_missing_categories_then_merges() {
        let incomplete = serde_json::json!({
            "security": [
                {"id": 1, "desc": "s1", "severity": "high"},
                {"id": 2, "desc": "s2", "severity": "high"},
                {"id": 3, "desc": "s3", "severity": "high"},
            ],
            "functionality": [
                {"id": 1, "desc": "f1", "severity": "high"},
                {"id": 2, "desc": "f2", "severity": "medium"},
                {"id": 3, "desc": "f3", "severity": "medium"},
            ],
            "style": [],
        })
        .to_string();
        let clarification = serde_json::json!({
            "style": [
                {"id": 1, "desc": "y1", "severity": "low"},
                {"id": 2, "desc": "y2", "severity": "low"},
                {"id": 3, "desc": "y3", "severity": "low"},
            ],
        })
        .to_string();

        let provider = ScriptedProvider::new(vec![&incomplete, &clarification]);
        let set = extractor(&provider).extract("spec").await.unwrap();
        assert_eq!(set.style.len(), 3);
        assert_eq!(
            set.style.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn fails_when_category_never_materializes() {
        let incomplete = serde_json::json!({
            "security": [{"id": 1, "desc": "s1", "severity": "high"}],
            "functionality": [{"id": 1, "desc": "f1", "severity": "high"}],
            "style": [],
        })
        .to_string();

        // every call, including clarifications, returns the same payload
        let provider = ScriptedProvider::new(vec![&incomplete]);
        let err = extractor(&provider).extract("spec").await.unwrap_err();
        match err {
            VerifyError::ExtractionFailed(msg) => assert!(msg.contains("style")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_burns_attempts_then_fails() {
        let provider = ScriptedProvider::new(vec!["not json at all"]);
        let err = extractor(&provider).extract("spec").await.unwrap_err();
        assert!(matches!(err, VerifyError::ExtractionFailed(_)));
    }
}
