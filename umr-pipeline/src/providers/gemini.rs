//! Google Gemini vision provider
//!
//! Free-tier primary provider. Requests are spaced through a `governor` rate
//! limiter (default one request every 6 seconds) to stay inside the quota.

use base64::Engine;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use umr_common::config::ProviderSection;

use super::{api_error, http_client, prompt, ProviderError, ProviderOutput, TranscriptionHints, VisionProvider};
use crate::types::ApiUsage;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_MIN_INTERVAL_MS: u64 = 6000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Gemini `generateContent` client
pub struct GeminiProvider {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    min_interval: Duration,
    /// `None` when spacing is disabled (`min_interval_ms = 0`)
    rate_limiter: Option<DirectLimiter>,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        Ok(Self {
            http_client: http_client()?,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            min_interval: Duration::ZERO,
            rate_limiter: None,
        }
        .with_min_interval(Duration::from_millis(DEFAULT_MIN_INTERVAL_MS)))
    }

    /// Space requests at least `min_interval` apart
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        // Burst of one: the first request goes out at once, the next waits
        // a full period
        self.rate_limiter = Quota::with_period(min_interval).map(DirectLimiter::direct);
        self.min_interval = min_interval;
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    async fn pace(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
    }

    pub fn from_section(section: &ProviderSection, api_key: String) -> Result<Self, ProviderError> {
        let mut provider = Self::new(api_key)?;
        if let Some(model) = &section.model {
            provider.model = model.clone();
        }
        if let Some(base_url) = &section.base_url {
            provider.base_url = base_url.trim_end_matches('/').to_string();
        }
        let min_interval = section.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS);
        Ok(provider.with_min_interval(Duration::from_millis(min_interval)))
    }
}

#[async_trait::async_trait]
impl VisionProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
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
        self.pace().await;

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt::build_prompt(hints) },
                    { "inline_data": {
                        "mime_type": media_type,
                        "data": base64::engine::general_purpose::STANDARD.encode(image),
                    }}
                ]
            }],
            "generationConfig": {
                "temperature": 0.1,
                "response_mime_type": "application/json",
            }
        });

        debug!(model = %self.model, meter = %hints.meter_name, "Querying Gemini API");

        let response = self
            .http_client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let parsed: GenerateContentResponse = response.json().await?;

        let text = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(ProviderError::Malformed("empty Gemini response".to_string()));
        }

        let usage = parsed.usage_metadata.map(|u| ApiUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });

        Ok(ProviderOutput { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_section_overrides() {
        let section = ProviderSection {
            kind: umr_common::config::ProviderKind::Gemini,
            model: Some("gemini-2.0-flash".into()),
            api_key: None,
            base_url: Some("http://localhost:9999/v1beta/".into()),
            min_interval_ms: Some(100),
            enabled: true,
        };
        let provider = GeminiProvider::from_section(&section, "k".into()).unwrap();
        assert_eq!(provider.model(), "gemini-2.0-flash");
        assert_eq!(provider.base_url, "http://localhost:9999/v1beta");
        assert_eq!(provider.min_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_requests_are_spaced() {
        let provider = GeminiProvider::new("k".into())
            .unwrap()
            .with_min_interval(Duration::from_millis(200));
        let start = std::time::Instant::now();

        // First request - no wait
        provider.pace().await;
        assert!(start.elapsed() < Duration::from_millis(100));

        // Second request - waits out the period
        provider.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_zero_interval_disables_spacing() {
        let provider = GeminiProvider::new("k".into())
            .unwrap()
            .with_min_interval(Duration::ZERO);
        assert!(provider.rate_limiter.is_none());

        let start = std::time::Instant::now();
        for _ in 0..5 {
            provider.pace().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_response_shape_deserializes() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "{\"digital_reading\": 1}"}], "role": "model"}}],
            "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 40, "totalTokenCount": 1240}
        }"#;
        let parsed: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
        assert_eq!(parsed.usage_metadata.unwrap().total_token_count, Some(1240));
    }
}
