//! OpenAI Chat Completions provider
//!
//! Also covers OpenAI-compatible local servers: point `base_url` at e.g.
//! `http://localhost:11434/v1` (Ollama) and leave the key unset.

use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use umr_common::config::ProviderSection;

use super::{api_error, http_client, prompt, ProviderError, ProviderOutput, TranscriptionHints, VisionProvider};
use crate::types::ApiUsage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

/// Chat Completions client
pub struct OpenAiProvider {
    http_client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            http_client: http_client()?,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn from_section(
        section: &ProviderSection,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut provider = Self::new(api_key)?;
        if let Some(model) = &section.model {
            provider.model = model.clone();
        }
        if let Some(base_url) = &section.base_url {
            provider.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(provider)
    }
}

#[async_trait::async_trait]
impl VisionProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn transcribe(
        &self,
        image: &[u8],
        media_type: &str,
        hints: &TranscriptionHints,
    ) -> Result<ProviderOutput, ProviderError> {
        let data_url = format!(
            "data:{};base64,{}",
            media_type,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": 0.1,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt::build_prompt(hints) },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }]
        });

        debug!(model = %self.model, base_url = %self.base_url, meter = %hints.meter_name, "Querying chat completions API");

        let mut request = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let parsed: ChatResponse = response.json().await?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ProviderError::Malformed("no message content in response".to_string()))?;

        let usage = parsed.usage.map(|u| ApiUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ProviderOutput { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_endpoint_without_key() {
        let section = ProviderSection {
            kind: umr_common::config::ProviderKind::Openai,
            model: Some("llama3.2-vision:11b".into()),
            api_key: None,
            base_url: Some("http://localhost:11434/v1/".into()),
            min_interval_ms: None,
            enabled: true,
        };
        let provider = OpenAiProvider::from_section(&section, None).unwrap();
        assert_eq!(provider.model(), "llama3.2-vision:11b");
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
        assert!(provider.api_key.is_none());
    }

    #[test]
    fn test_response_shape_deserializes() {
        let json = r#"{
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{}"}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 30, "total_tokens": 930}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{}"));
        assert_eq!(parsed.usage.unwrap().total_tokens, Some(930));
    }
}
