//! Provider chain
//!
//! Tries vision providers in configured priority order until one returns a
//! schema-conformant reading. Each attempt runs under a bounded timeout; a
//! transport error, timeout or malformed answer is recorded and the next
//! provider is tried. The first success wins: later providers are never
//! invoked once a reading has been obtained.
//!
//! Every attempt (successful or not) is returned to the caller and, when a
//! ledger is attached, appended to the attempt ledger for cost and
//! diagnostic reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::providers::{response, ProviderError, TranscriptionHints, VisionProvider};
use crate::storage::AttemptLedger;
use crate::types::{ApiUsage, Reading};

/// Result category of one provider attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Transport,
    Timeout,
    Malformed,
}

/// One provider invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider_id: String,
    pub provider_model: String,
    pub meter_name: String,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ApiUsage>,
}

/// Successful chain result
#[derive(Debug, Clone)]
pub struct Transcription {
    pub reading: Reading,
    /// All attempts made, the last one being the success
    pub attempts: Vec<AttemptRecord>,
}

/// Priority-ordered list of vision providers
pub struct ProviderChain {
    providers: Vec<Arc<dyn VisionProvider>>,
    timeout: Duration,
    ledger: Option<Arc<AttemptLedger>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn VisionProvider>>, timeout: Duration) -> Self {
        Self {
            providers,
            timeout,
            ledger: None,
        }
    }

    /// Attach an attempt ledger
    pub fn with_ledger(mut self, ledger: Arc<AttemptLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider ids in priority order
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    /// Transcribe one image
    ///
    /// Fails with `NoProviderSucceeded` only if every provider failed or
    /// returned a malformed result.
    pub async fn transcribe(
        &self,
        image: &[u8],
        media_type: &str,
        hints: &TranscriptionHints,
    ) -> Result<Transcription, PipelineError> {
        let mut attempts = Vec::with_capacity(self.providers.len());

        for (priority, provider) in self.providers.iter().enumerate() {
            let started_at = Utc::now();
            let start = Instant::now();

            let result =
                match tokio::time::timeout(self.timeout, provider.transcribe(image, media_type, hints))
                    .await
                {
                    Ok(Ok(output)) => response::parse_reading(
                        &output.text,
                        provider.id(),
                        provider.model(),
                        output.usage.clone(),
                    )
                    .map_err(|e| (e, output.usage)),
                    Ok(Err(e)) => Err((e, None)),
                    Err(_) => Err((ProviderError::Timeout(self.timeout), None)),
                };

            let latency_ms = start.elapsed().as_millis() as u64;
            let mut record = AttemptRecord {
                provider_id: provider.id().to_string(),
                provider_model: provider.model().to_string(),
                meter_name: hints.meter_name.clone(),
                started_at,
                latency_ms,
                outcome: AttemptOutcome::Success,
                error: None,
                usage: None,
            };

            match result {
                Ok(reading) => {
                    record.usage = reading.api_usage().cloned();
                    self.record(&record).await;
                    attempts.push(record);

                    info!(
                        meter = %hints.meter_name,
                        provider = %provider.id(),
                        priority = priority + 1,
                        latency_ms,
                        total = reading.total_reading(),
                        confidence = %reading.confidence(),
                        "Transcription succeeded"
                    );
                    return Ok(Transcription { reading, attempts });
                }
                Err((e, usage)) => {
                    record.outcome = match e {
                        ProviderError::Timeout(_) => AttemptOutcome::Timeout,
                        ProviderError::Malformed(_) => AttemptOutcome::Malformed,
                        _ => AttemptOutcome::Transport,
                    };
                    record.error = Some(e.to_string());
                    record.usage = usage;
                    self.record(&record).await;
                    attempts.push(record);

                    warn!(
                        meter = %hints.meter_name,
                        provider = %provider.id(),
                        latency_ms,
                        error = %e,
                        "Provider attempt failed, trying next"
                    );
                }
            }
        }

        Err(PipelineError::NoProviderSucceeded { attempts })
    }

    async fn record(&self, attempt: &AttemptRecord) {
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.append(attempt).await {
                warn!(error = %e, "Failed to write provider attempt ledger");
            }
        }
    }
}
