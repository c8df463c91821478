pub mod types;

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub mod batch;
pub mod cache;
pub mod retry;
pub mod router;

mod error;

pub use error::ProviderError;
pub use types::*;

use verdex_config::{find_provider_def, split_model_spec};

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Build the provider for a `provider/model` spec. Credentials come from the
/// provider's env var only; a missing required key is a configuration error.
/// Returns the provider and the bare model id to put in requests.
pub fn create_provider(model_spec: &str) -> Result<(Box<dyn Provider>, String), ProviderError> {
    let (provider_id, model) = split_model_spec(model_spec)
        .map_err(|e| ProviderError::Config(e.to_string()))?;

    let def = find_provider_def(provider_id)
        .ok_or_else(|| ProviderError::Config(format!("unknown provider '{provider_id}'")))?;

    let api_key = if def.env_var.is_empty() {
        String::new()
    } else {
        std::env::var(def.env_var).map_err(|_| {
            ProviderError::Config(format!(
                "missing env var {} for provider '{provider_id}'",
                def.env_var
            ))
        })?
    };

    let base_url = def.default_base_url.to_string();

    let provider: Box<dyn Provider> = match def.api_style {
        "anthropic" => Box::new(anthropic::AnthropicProvider::new(api_key, base_url)),
        "gemini" => Box::new(gemini::GeminiProvider::new(api_key, base_url)),
        _ => Box::new(openai::OpenAIStyleProvider::new(
            provider_id.to_string(),
            api_key,
            base_url,
        )),
    };

    Ok((provider, model.to_string()))
}
