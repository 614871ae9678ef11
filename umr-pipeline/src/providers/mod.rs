//! Vision providers
//!
//! A `VisionProvider` wraps one external image-to-text transcription service.
//! Providers are thin transports: they send the rotated image plus a
//! meter-specific prompt and hand back the model's raw text and token usage.
//! Turning that text into a [`Reading`](crate::types::Reading) is the chain's
//! job (see [`response::parse_reading`]), so provider-specific shapes never
//! leak downstream.
//!
//! # Backends
//! - `gemini` - Google Generative Language API (free tier, rate limited)
//! - `anthropic` - Anthropic Messages API
//! - `openai` - OpenAI Chat Completions, or any compatible local server

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod prompt;
pub mod response;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use umr_common::config::{resolve_provider_key, MeterSection, ProviderKind, ProviderSection};
use umr_common::MeterType;

use crate::types::ApiUsage;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// HTTP timeout applied by each backend's client (the chain adds its own bound)
pub(crate) const HTTP_TIMEOUT_SECS: u64 = 60;

/// Provider transport errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        } else if e.is_decode() {
            ProviderError::Malformed(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Meter facts that shape the prompt
#[derive(Debug, Clone)]
pub struct TranscriptionHints {
    pub meter_name: String,
    pub meter_type: MeterType,
    pub unit: String,
    pub has_sub_unit_wheel: bool,
    pub has_dial: bool,
}

impl TranscriptionHints {
    pub fn for_meter(meter: &MeterSection) -> Self {
        Self {
            meter_name: meter.name.clone(),
            meter_type: meter.meter_type,
            unit: meter.unit().to_string(),
            has_sub_unit_wheel: meter.has_sub_unit_wheel,
            has_dial: meter.has_dial,
        }
    }
}

/// Raw provider output before schema validation
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub text: String,
    pub usage: Option<ApiUsage>,
}

/// One external transcription service
///
/// # Example
/// ```rust,ignore
/// #[async_trait::async_trait]
/// impl VisionProvider for MyProvider {
///     fn id(&self) -> &str { "mine" }
///     fn model(&self) -> &str { "vision-1" }
///
///     async fn transcribe(&self, image: &[u8], media_type: &str, hints: &TranscriptionHints)
///         -> Result<ProviderOutput, ProviderError> {
///         let text = call_service(image, media_type, &prompt::build_prompt(hints)).await?;
///         Ok(ProviderOutput { text, usage: None })
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait VisionProvider: Send + Sync {
    /// Provider identifier recorded on readings and attempts
    fn id(&self) -> &str;

    /// Model name recorded on readings and attempts
    fn model(&self) -> &str;

    /// Send one image for transcription
    async fn transcribe(
        &self,
        image: &[u8],
        media_type: &str,
        hints: &TranscriptionHints,
    ) -> Result<ProviderOutput, ProviderError>;
}

/// Instantiate configured providers in priority order
///
/// Providers without a usable credential are skipped with a warning, except
/// OpenAI-compatible endpoints with an explicit `base_url` (local servers
/// such as Ollama do not need a key).
pub fn build_providers(sections: &[ProviderSection]) -> Vec<Arc<dyn VisionProvider>> {
    let mut providers: Vec<Arc<dyn VisionProvider>> = Vec::new();

    for section in sections.iter().filter(|s| s.enabled) {
        let key = resolve_provider_key(section);
        let built: Result<Arc<dyn VisionProvider>, ProviderError> = match section.kind {
            ProviderKind::Gemini => key
                .ok_or_else(|| ProviderError::NotConfigured(missing_key(section.kind)))
                .and_then(|k| GeminiProvider::from_section(section, k))
                .map(|p| Arc::new(p) as Arc<dyn VisionProvider>),
            ProviderKind::Anthropic => key
                .ok_or_else(|| ProviderError::NotConfigured(missing_key(section.kind)))
                .and_then(|k| AnthropicProvider::from_section(section, k))
                .map(|p| Arc::new(p) as Arc<dyn VisionProvider>),
            ProviderKind::Openai => {
                if key.is_none() && section.base_url.is_none() {
                    Err(ProviderError::NotConfigured(missing_key(section.kind)))
                } else {
                    OpenAiProvider::from_section(section, key)
                        .map(|p| Arc::new(p) as Arc<dyn VisionProvider>)
                }
            }
        };

        match built {
            Ok(provider) => {
                info!(
                    provider = %provider.id(),
                    model = %provider.model(),
                    priority = providers.len() + 1,
                    "Vision provider enabled"
                );
                providers.push(provider);
            }
            Err(e) => warn!(provider = %section.kind, error = %e, "Skipping vision provider"),
        }
    }

    providers
}

fn missing_key(kind: ProviderKind) -> String {
    format!(
        "no API key for {} (set {} or api_key in config)",
        kind,
        kind.api_key_env()
    )
}

/// Build the shared reqwest client used by HTTP backends
pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .user_agent(concat!("umr-pipeline/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| ProviderError::Network(e.to_string()))
}

/// Turn a non-success HTTP response into `ProviderError::Api`
pub(crate) async fn api_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ProviderError::Api {
        status,
        message: truncate(&message, 500),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
