//! Runtime assembly from the bootstrap TOML configuration
//!
//! Turns a validated [`TomlConfig`] plus the resolved root folder into a
//! ready-to-run [`Orchestrator`]: providers in priority order, the attempt
//! ledger, camera capture, stores and the time-series sink.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use umr_common::config::{RootFolderInitializer, TomlConfig};

use crate::capture::{CaptureSource, HttpCapture};
use crate::chain::ProviderChain;
use crate::error::PipelineError;
use crate::providers::build_providers;
use crate::sink::{DisabledSink, InfluxSink, TimeSeriesSink};
use crate::storage::{ArchiveStore, AttemptLedger, ReadingLog};
use crate::workflow::{Orchestrator, PipelineSettings};

/// Build the provider chain described by the configuration
pub fn build_chain(config: &TomlConfig, layout: &RootFolderInitializer) -> ProviderChain {
    let providers = build_providers(&config.providers);
    if providers.is_empty() && !config.meters.is_empty() {
        warn!("No usable vision provider configured; every run will fail");
    }

    ProviderChain::new(
        providers,
        Duration::from_secs(config.pipeline.provider_timeout_secs),
    )
    .with_ledger(Arc::new(AttemptLedger::new(layout.attempts_path())))
}

/// Build the time-series sink, or a disabled one when not configured
pub fn build_sink(config: &TomlConfig) -> Arc<dyn TimeSeriesSink> {
    let timeout = Duration::from_secs(config.pipeline.sink_timeout_secs);
    match &config.influxdb {
        Some(section) => match InfluxSink::from_section(section, timeout) {
            Ok(sink) => {
                info!(url = %section.url, bucket = %section.bucket, "InfluxDB sink enabled");
                Arc::new(sink)
            }
            Err(e) => {
                warn!(error = %e, "InfluxDB sink unavailable, time-series writes disabled");
                Arc::new(DisabledSink)
            }
        },
        None => {
            info!("No [influxdb] section, time-series writes disabled");
            Arc::new(DisabledSink)
        }
    }
}

/// Assemble the orchestrator with HTTP camera capture
pub fn build_orchestrator(
    config: &TomlConfig,
    layout: &RootFolderInitializer,
) -> Result<Orchestrator, PipelineError> {
    let capture: Arc<dyn CaptureSource> = Arc::new(HttpCapture::new(&config.meters)?);
    build_orchestrator_with_capture(config, layout, capture)
}

/// Assemble the orchestrator around a given capture source
pub fn build_orchestrator_with_capture(
    config: &TomlConfig,
    layout: &RootFolderInitializer,
    capture: Arc<dyn CaptureSource>,
) -> Result<Orchestrator, PipelineError> {
    Orchestrator::new(
        config.meters.clone(),
        PipelineSettings::from(&config.pipeline),
        build_chain(config, layout),
        capture,
        ArchiveStore::new(layout.archive_dir()),
        ReadingLog::new(layout.log_dir()),
        build_sink(config),
    )
}
