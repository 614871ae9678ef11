//! Anthropic Claude vision provider (paid fallback)

use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use umr_common::config::ProviderSection;

use super::{api_error, http_client, prompt, ProviderError, ProviderOutput, TranscriptionHints, VisionProvider};
use crate::types::ApiUsage;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

/// Anthropic Messages API client
pub struct AnthropicProvider {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        Ok(Self {
            http_client: http_client()?,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn from_section(section: &ProviderSection, api_key: String) -> Result<Self, ProviderError> {
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
impl VisionProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
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
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": base64::engine::general_purpose::STANDARD.encode(image),
                        }
                    },
                    { "type": "text", "text": prompt::build_prompt(hints) }
                ]
            }]
        });

        debug!(model = %self.model, meter = %hints.meter_name, "Querying Anthropic API");

        let response = self
            .http_client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let parsed: MessagesResponse = response.json().await?;

        let text = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(ProviderError::Malformed("no text block in response".to_string()));
        }

        let usage = parsed
            .usage
            .map(|u| ApiUsage::new(u.input_tokens, u.output_tokens));

        Ok(ProviderOutput { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let provider = AnthropicProvider::new("k".into()).unwrap();
        assert_eq!(provider.id(), "anthropic");
        assert_eq!(provider.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_response_shape_deserializes() {
        let json = r#"{
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "{}"}],
            "usage": {"input_tokens": 1500, "output_tokens": 60}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(json).unwrap();
        let usage = parsed.usage.unwrap();
        assert_eq!(
            ApiUsage::new(usage.input_tokens, usage.output_tokens).total_tokens,
            Some(1560)
        );
    }
}
