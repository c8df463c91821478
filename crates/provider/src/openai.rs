use serde_json::json;
use std::time::Instant;

use crate::types::*;
use crate::{Provider, ProviderError};

/// Adapter for the OpenAI-compatible chat API. Also serves Groq, DeepSeek,
/// Together and Ollama through their `base_url`.
pub struct OpenAIStyleProvider {
    client: reqwest::Client,
    provider_id: String,
    base_url: String,
    api_key: String,
}

impl OpenAIStyleProvider {
    pub fn new(provider_id: String, api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            provider_id,
            base_url,
            api_key,
        }
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIStyleProvider {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        let start = Instant::now();
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_http(
                status.as_u16(),
                body,
                retry_after.as_deref(),
            ));
        }

        let data: serde_json::Value = resp.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::Deserialization("missing choices[0].message.content".into())
            })?
            .to_string();

        Ok(ChatResponse {
            content,
            usage: Some(Usage {
                input_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            }),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}
