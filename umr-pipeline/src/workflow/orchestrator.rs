//! Pipeline orchestrator
//!
//! Sequences Capture → ProviderChain → Validator → ArchiveStore → ReadingLog →
//! TimeSeriesSink for one meter at a time.
//!
//! # Concurrency
//! Each meter has its own async mutex. A run, a re-analysis, a delete and a
//! rotation change for the same meter are serialized through it; different
//! meters never share a lock and proceed independently. The reading log has
//! its own per-type append lock.
//!
//! # Failure handling
//! - Capture or transcription failure: nothing is persisted
//! - Archive failure: nothing is logged
//! - Log failure: the archive entry just written is deleted again
//! - Sink failure: logged as a warning, run still `Complete`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use umr_common::config::{MeterSection, PipelineSection};
use umr_common::time::now;
use umr_common::MeterType;
use uuid::Uuid;

use super::{PipelineEvent, PipelineState};
use crate::capture::CaptureSource;
use crate::chain::{AttemptRecord, ProviderChain};
use crate::error::PipelineError;
use crate::image_ops;
use crate::providers::TranscriptionHints;
use crate::sink::TimeSeriesSink;
use crate::storage::{ArchiveStore, ReadingLog};
use crate::types::{ArchivedSnapshot, LogEntry, Reading, Rotation, Snapshot};
use crate::validator::{ReadingValidator, ValidationWarning};

/// Global pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Default jump threshold (meters may override)
    pub jump_threshold: f64,
    /// Prior log entries read back for validation
    pub history_depth: usize,
    pub sink_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineSection::default())
    }
}

impl From<&PipelineSection> for PipelineSettings {
    fn from(section: &PipelineSection) -> Self {
        Self {
            jump_threshold: section.jump_threshold,
            history_depth: section.history_depth,
            sink_timeout: Duration::from_secs(section.sink_timeout_secs),
        }
    }
}

/// Result of the best-effort sink write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SinkOutcome {
    Written,
    Failed(String),
    TimedOut,
}

/// Handle to the detached sink write of a completed run
///
/// Dropping it does not cancel the write.
#[derive(Debug)]
pub struct SinkTicket {
    handle: JoinHandle<SinkOutcome>,
}

impl SinkTicket {
    /// Wait for the sink write (diagnostics and tests only)
    pub async fn outcome(self) -> SinkOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => SinkOutcome::Failed(format!("sink task aborted: {}", e)),
        }
    }
}

/// Report of a completed run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub meter_name: String,
    pub state: PipelineState,
    pub captured_at: DateTime<Utc>,
    pub reading: Reading,
    pub validation_warning: Option<ValidationWarning>,
    pub archive_id: String,
    pub archive_path: PathBuf,
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip)]
    pub sink: SinkTicket,
}

/// Per-meter run counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MeterStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_total: Option<f64>,
    pub last_error: Option<String>,
}

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Archive entries moved to quarantine because their run never reached the log
    pub orphans_quarantined: usize,
    /// Temp files and metadata-less images removed
    pub residue_swept: usize,
    /// Meters whose log was unreadable or damaged
    pub meters_skipped: usize,
}

/// Log entries of one meter across all meter type logs
#[derive(Debug, Default)]
struct LoggedRuns {
    ids: HashSet<String>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Pipeline orchestrator
pub struct Orchestrator {
    meters: Vec<MeterSection>,
    settings: PipelineSettings,
    chain: Arc<ProviderChain>,
    capture: Arc<dyn CaptureSource>,
    archive: ArchiveStore,
    log: Arc<ReadingLog>,
    sink: Arc<dyn TimeSeriesSink>,
    meter_locks: HashMap<String, Arc<Mutex<()>>>,
    rotations: RwLock<HashMap<String, Rotation>>,
    stats: Mutex<HashMap<String, MeterStats>>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl Orchestrator {
    /// Create orchestrator for the configured meters
    pub fn new(
        meters: Vec<MeterSection>,
        settings: PipelineSettings,
        chain: ProviderChain,
        capture: Arc<dyn CaptureSource>,
        archive: ArchiveStore,
        log: ReadingLog,
        sink: Arc<dyn TimeSeriesSink>,
    ) -> Result<Self, PipelineError> {
        let mut rotations = HashMap::new();
        let mut meter_locks = HashMap::new();
        for meter in &meters {
            let rotation = Rotation::try_from(meter.rotation).map_err(PipelineError::InvalidInput)?;
            if meter_locks
                .insert(meter.name.clone(), Arc::new(Mutex::new(())))
                .is_some()
            {
                return Err(PipelineError::InvalidInput(format!(
                    "meter '{}' configured more than once",
                    meter.name
                )));
            }
            rotations.insert(meter.name.clone(), rotation);
        }

        Ok(Self {
            meters,
            settings,
            chain: Arc::new(chain),
            capture,
            archive,
            log: Arc::new(log),
            sink,
            meter_locks,
            rotations: RwLock::new(rotations),
            stats: Mutex::new(HashMap::new()),
            event_tx: None,
        })
    }

    /// Attach event channel for progress reporting
    pub fn with_events(mut self, event_tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn meters(&self) -> &[MeterSection] {
        &self.meters
    }

    pub fn meter(&self, name: &str) -> Result<&MeterSection, PipelineError> {
        self.meters
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| PipelineError::NotFound(format!("meter '{}'", name)))
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn reading_log(&self) -> &ReadingLog {
        &self.log
    }

    /// Execute one pipeline run for a meter
    ///
    /// Waits for any in-flight run or administrative operation on the same
    /// meter to finish first.
    pub async fn run(&self, meter_name: &str) -> Result<RunReport, PipelineError> {
        let meter = self.meter(meter_name)?;
        let lock = self.lock_for(meter_name)?;
        let _guard = lock.lock().await;

        let run_id = Uuid::new_v4();
        info!(meter = %meter_name, run_id = %run_id, "Pipeline run started");

        let result = self.run_locked(run_id, meter).await;

        let mut stats = self.stats.lock().await;
        let entry = stats.entry(meter_name.to_string()).or_default();
        entry.total_runs += 1;
        entry.last_run_at = Some(now());
        match &result {
            Ok(report) => {
                entry.successful_runs += 1;
                entry.last_total = Some(report.reading.total_reading());
                entry.last_error = None;
            }
            Err(e) => {
                entry.failed_runs += 1;
                entry.last_error = Some(e.to_string());
            }
        }
        drop(stats);

        if let Err(e) = &result {
            error!(meter = %meter_name, run_id = %run_id, code = e.code(), error = %e, "Pipeline run failed");
            self.emit_event(PipelineEvent::RunFailed {
                run_id,
                meter: meter_name.to_string(),
                code: e.code().to_string(),
                message: e.to_string(),
            })
            .await;
        }

        result
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        meter: &MeterSection,
    ) -> Result<RunReport, PipelineError> {
        let mut state: Option<PipelineState> = None;

        // Capture
        let image = match self.capture.capture(&meter.name).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(run_id, meter, &mut state, e).await,
        };
        let snapshot = Snapshot {
            meter_name: meter.name.clone(),
            meter_type: meter.meter_type,
            captured_at: now(),
            image,
            rotation: self.get_rotation(&meter.name).await?,
            camera_source: self.capture.source_for(&meter.name),
        };
        self.advance(run_id, meter, &mut state, PipelineState::Captured).await;

        // Captured → Transcribed
        let rotated = match rotate_owned(&snapshot.image, snapshot.rotation).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(run_id, meter, &mut state, e).await,
        };
        let media_type = image_ops::media_type(&rotated);
        let hints = TranscriptionHints::for_meter(meter);

        let transcription = match self.chain.transcribe(&rotated, media_type, &hints).await {
            Ok(t) => t,
            Err(e) => return self.fail(run_id, meter, &mut state, e).await,
        };
        drop(rotated);
        let reading = transcription.reading;
        self.advance(run_id, meter, &mut state, PipelineState::Transcribed).await;

        // Transcribed → Validated
        let history = match self
            .log
            .recent(meter.meter_type, &meter.name, self.settings.history_depth)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(meter = %meter.name, error = %e, "Reading history unavailable, validating without baseline");
                Vec::new()
            }
        };
        let validator = self.validator_for(meter);
        let warning = validator.validate(&reading, &history).warning();
        if let Some(w) = warning {
            warn!(
                meter = %meter.name,
                total = reading.total_reading(),
                previous = ?history.last().map(|e| e.reading.total_reading()),
                warning = %w,
                "Reading failed plausibility check"
            );
        }
        self.advance(run_id, meter, &mut state, PipelineState::Validated).await;

        // Validated → Archived
        let archived = match self
            .archive
            .archive(&snapshot, &reading, warning.map(|w| w.to_string()))
            .await
        {
            Ok(a) => a,
            Err(e) => return self.fail(run_id, meter, &mut state, e).await,
        };
        self.advance(run_id, meter, &mut state, PipelineState::Archived).await;

        // Archived → Logged
        let entry = LogEntry {
            run_id,
            timestamp: snapshot.captured_at,
            meter_name: meter.name.clone(),
            meter_type: meter.meter_type,
            archive_id: archived.id.clone(),
            image_filename: archived.metadata.snapshot.filename.clone(),
            reading: reading.clone(),
            validation_warning: warning.map(|w| w.to_string()),
        };
        if let Err(e) = self.log.append(&entry).await {
            self.compensate(&meter.name, &archived).await;
            return self.fail(run_id, meter, &mut state, e).await;
        }
        self.advance(run_id, meter, &mut state, PipelineState::Logged).await;

        // Logged → Sunk (detached, never awaited here)
        let sink = self.dispatch_sink(run_id, meter, &reading, snapshot.captured_at);
        self.advance(run_id, meter, &mut state, PipelineState::Sunk).await;

        self.advance(run_id, meter, &mut state, PipelineState::Complete).await;
        info!(
            meter = %meter.name,
            run_id = %run_id,
            total = reading.total_reading(),
            confidence = %reading.confidence(),
            provider = %reading.provider_id(),
            archive_id = %archived.id,
            "Pipeline run complete"
        );

        Ok(RunReport {
            run_id,
            meter_name: meter.name.clone(),
            state: PipelineState::Complete,
            captured_at: snapshot.captured_at,
            reading,
            validation_warning: warning,
            archive_id: archived.id,
            archive_path: archived.archive_path,
            attempts: transcription.attempts,
            sink,
        })
    }

    /// Undo the archive step after a log failure
    async fn compensate(&self, meter_name: &str, archived: &ArchivedSnapshot) {
        match self.archive.delete(meter_name, &archived.id).await {
            Ok(()) => warn!(
                meter = %meter_name,
                archive_id = %archived.id,
                "Removed archive entry of run that failed to log"
            ),
            Err(e) => error!(
                meter = %meter_name,
                archive_id = %archived.id,
                error = %e,
                "Orphaned archive entry left behind; reconcile will quarantine it"
            ),
        }
    }

    fn dispatch_sink(
        &self,
        run_id: Uuid,
        meter: &MeterSection,
        reading: &Reading,
        timestamp: DateTime<Utc>,
    ) -> SinkTicket {
        let sink = Arc::clone(&self.sink);
        let event_tx = self.event_tx.clone();
        let reading = reading.clone();
        let meter_name = meter.name.clone();
        let meter_type = meter.meter_type;
        let timeout = self.settings.sink_timeout;

        let handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(
                timeout,
                sink.write(&reading, &meter_name, meter_type, timestamp),
            )
            .await
            {
                Ok(Ok(())) => {
                    debug!(meter = %meter_name, sink = %sink.name(), "Time-series point written");
                    SinkOutcome::Written
                }
                Ok(Err(e)) => {
                    warn!(meter = %meter_name, sink = %sink.name(), error = %e, "Time-series write failed");
                    SinkOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(meter = %meter_name, sink = %sink.name(), timeout_ms = timeout.as_millis() as u64, "Time-series write timed out");
                    SinkOutcome::TimedOut
                }
            };

            if let Some(tx) = event_tx {
                let _ = tx
                    .send(PipelineEvent::SinkFinished {
                        run_id,
                        meter: meter_name,
                        outcome: outcome.clone(),
                    })
                    .await;
            }
            outcome
        });

        SinkTicket { handle }
    }

    /// Re-transcribe an archived snapshot in place
    ///
    /// The new reading is validated against the log entries that precede
    /// the snapshot, so a corrected misread also loses its stale warning.
    pub async fn reanalyze(
        &self,
        meter_name: &str,
        archive_id: &str,
    ) -> Result<ArchivedSnapshot, PipelineError> {
        let meter = self.meter(meter_name)?;
        let lock = self.lock_for(meter_name)?;
        let _guard = lock.lock().await;

        let archived = self.archive.get(meter_name, archive_id).await?;
        let snapshot = &archived.metadata.snapshot;
        let history = self
            .log
            .recent_before(
                snapshot.meter_type,
                meter_name,
                snapshot.timestamp,
                self.settings.history_depth,
            )
            .await?;

        self.archive
            .reanalyze(
                archived,
                &self.chain,
                &TranscriptionHints::for_meter(meter),
                &self.validator_for(meter),
                &history,
            )
            .await
    }

    /// Delete an archived snapshot (image and metadata)
    pub async fn delete(&self, meter_name: &str, archive_id: &str) -> Result<(), PipelineError> {
        self.meter(meter_name)?;
        let lock = self.lock_for(meter_name)?;
        let _guard = lock.lock().await;

        self.archive.delete(meter_name, archive_id).await
    }

    /// Current rotation of a meter
    pub async fn get_rotation(&self, meter_name: &str) -> Result<Rotation, PipelineError> {
        self.rotations
            .read()
            .await
            .get(meter_name)
            .copied()
            .ok_or_else(|| PipelineError::NotFound(format!("meter '{}'", meter_name)))
    }

    /// Change the rotation applied to future captures of a meter
    ///
    /// In-memory only; the configuration file is not rewritten.
    pub async fn set_rotation(&self, meter_name: &str, degrees: u16) -> Result<Rotation, PipelineError> {
        let rotation = Rotation::try_from(degrees).map_err(PipelineError::InvalidInput)?;
        self.meter(meter_name)?;
        let lock = self.lock_for(meter_name)?;
        let _guard = lock.lock().await;

        self.rotations
            .write()
            .await
            .insert(meter_name.to_string(), rotation);
        info!(meter = %meter_name, rotation = %rotation, "Rotation updated");
        Ok(rotation)
    }

    /// Quarantine archive entries whose run never reached the log, then sweep residue
    ///
    /// An entry only counts as orphaned when it is missing from every
    /// meter type's log and was captured after the meter's last logged
    /// entry; older unlogged entries are left alone. Orphan detection is
    /// skipped for a meter when its log cannot be read or has a damaged line
    /// after the meter's last good entry, since that line may be the missing
    /// commit. Orphans are moved aside, never deleted.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PipelineError> {
        let mut report = ReconcileReport::default();

        for meter in &self.meters {
            let lock = self.lock_for(&meter.name)?;
            let _guard = lock.lock().await;

            match self.logged_runs(meter).await {
                Ok(Some(logged)) => {
                    for archived in self.archive.list(&meter.name, None).await? {
                        if logged.ids.contains(&archived.id) {
                            continue;
                        }
                        let after_last = logged
                            .last_timestamp
                            .map_or(true, |last| archived.metadata.snapshot.timestamp > last);
                        if after_last {
                            self.archive.quarantine(&meter.name, &archived.id).await?;
                            report.orphans_quarantined += 1;
                        } else {
                            warn!(
                                meter = %meter.name,
                                archive_id = %archived.id,
                                "Archive entry predates the last logged run but is not in the log, kept"
                            );
                        }
                    }
                }
                Ok(None) => report.meters_skipped += 1,
                Err(e) => {
                    warn!(meter = %meter.name, error = %e, "Skipping orphan detection, log unreadable");
                    report.meters_skipped += 1;
                }
            }

            report.residue_swept += self.archive.sweep(&meter.name).await?;
        }

        info!(
            orphans_quarantined = report.orphans_quarantined,
            residue_swept = report.residue_swept,
            meters_skipped = report.meters_skipped,
            "Archive reconciliation complete"
        );
        Ok(report)
    }

    /// Archive ids a meter has in any log, or `None` when the current log is
    /// damaged after the meter's last good entry
    async fn logged_runs(&self, meter: &MeterSection) -> Result<Option<LoggedRuns>, PipelineError> {
        let mut logged = LoggedRuns::default();

        for meter_type in MeterType::ALL {
            let scan = self.log.scan(meter_type).await?;
            let mut last_line = None;
            for (line, entry) in scan.entries {
                if entry.meter_name != meter.name {
                    continue;
                }
                last_line = Some(line);
                if logged.last_timestamp.map_or(true, |t| entry.timestamp > t) {
                    logged.last_timestamp = Some(entry.timestamp);
                }
                logged.ids.insert(entry.archive_id);
            }

            if meter_type == meter.meter_type {
                if let Some(&line) = scan
                    .malformed
                    .iter()
                    .find(|&&l| last_line.map_or(true, |last| l > last))
                {
                    warn!(
                        meter = %meter.name,
                        log = %self.log.path_for(meter_type).display(),
                        line,
                        "Skipping orphan detection, damaged log line after last logged run"
                    );
                    return Ok(None);
                }
            }
        }

        Ok(Some(logged))
    }

    /// Run counters per meter
    pub async fn stats(&self) -> HashMap<String, MeterStats> {
        let stats = self.stats.lock().await;
        self.meters
            .iter()
            .map(|m| (m.name.clone(), stats.get(&m.name).cloned().unwrap_or_default()))
            .collect()
    }

    fn validator_for(&self, meter: &MeterSection) -> ReadingValidator {
        ReadingValidator::new(meter.jump_threshold.unwrap_or(self.settings.jump_threshold))
    }

    fn lock_for(&self, meter_name: &str) -> Result<Arc<Mutex<()>>, PipelineError> {
        self.meter_locks
            .get(meter_name)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("meter '{}'", meter_name)))
    }

    async fn advance(
        &self,
        run_id: Uuid,
        meter: &MeterSection,
        state: &mut Option<PipelineState>,
        to: PipelineState,
    ) {
        debug!(meter = %meter.name, run_id = %run_id, state = %to, "Pipeline state");
        let from = state.replace(to.clone());
        self.emit_event(PipelineEvent::StateChanged {
            run_id,
            meter: meter.name.clone(),
            from,
            to,
        })
        .await;
    }

    async fn fail<T>(
        &self,
        run_id: Uuid,
        meter: &MeterSection,
        state: &mut Option<PipelineState>,
        err: PipelineError,
    ) -> Result<T, PipelineError> {
        self.advance(run_id, meter, state, PipelineState::Failed(err.to_string()))
            .await;
        Err(err)
    }

    /// Emit pipeline event (if event channel is configured)
    async fn emit_event(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

async fn rotate_owned(image: &[u8], rotation: Rotation) -> Result<Vec<u8>, PipelineError> {
    if rotation == Rotation::None {
        return Ok(image.to_vec());
    }
    let image = image.to_vec();
    tokio::task::spawn_blocking(move || {
        image_ops::rotate(&image, rotation).map(|bytes| bytes.into_owned())
    })
    .await
    .map_err(|e| PipelineError::Image(e.to_string()))?
}
