//! Test Helper Utilities
//!
//! Fakes for the pipeline's external collaborators (vision providers, camera,
//! time-series sink) and a builder wiring them into an orchestrator rooted in
//! a temporary directory.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use umr_common::config::{MeterSection, RootFolderInitializer};
use umr_common::MeterType;

use umr_pipeline::capture::CaptureSource;
use umr_pipeline::chain::ProviderChain;
use umr_pipeline::providers::{
    ProviderError, ProviderOutput, TranscriptionHints, VisionProvider,
};
use umr_pipeline::sink::{SinkError, TimeSeriesSink};
use umr_pipeline::storage::{ArchiveStore, AttemptLedger, ReadingLog};
use umr_pipeline::types::{ApiUsage, Reading, Rotation, Snapshot};
use umr_pipeline::workflow::{Orchestrator, PipelineEvent, PipelineSettings};
use umr_pipeline::PipelineError;

/// Minimal JPEG signature; enough for media type sniffing and archiving
pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0xFF, 0xD9];

/// Provider timeout used by test chains
pub const TEST_PROVIDER_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Vision provider
// ============================================================================

/// One scripted provider behavior
#[derive(Debug, Clone)]
pub enum Script {
    /// Answer with this raw text
    Respond(String),
    /// Fail with a network error
    Fail(String),
    /// Never answer
    Hang,
}

/// Provider that plays back scripted answers
///
/// Answers are consumed in order; the last one repeats forever.
pub struct ScriptedProvider {
    id: String,
    model: String,
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    images: Mutex<Vec<(Vec<u8>, String)>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            model: format!("{}-test-model", id),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            images: Mutex::new(Vec::new()),
        })
    }

    pub fn responding(id: &str, text: impl Into<String>) -> Arc<Self> {
        Self::new(id, vec![Script::Respond(text.into())])
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Self::new(id, vec![Script::Fail(format!("{} unreachable", id))])
    }

    pub fn hanging(id: &str) -> Arc<Self> {
        Self::new(id, vec![Script::Hang])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Image bytes and media types received, oldest first
    pub fn images(&self) -> Vec<(Vec<u8>, String)> {
        self.images.lock().unwrap().clone()
    }

    fn next_script(&self) -> Script {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Script::Hang)
        }
    }
}

#[async_trait::async_trait]
impl VisionProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn transcribe(
        &self,
        image: &[u8],
        media_type: &str,
        _hints: &TranscriptionHints,
    ) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap()
            .push((image.to_vec(), media_type.to_string()));

        match self.next_script() {
            Script::Respond(text) => Ok(ProviderOutput {
                text,
                usage: Some(ApiUsage::new(Some(1200), Some(80))),
            }),
            Script::Fail(message) => Err(ProviderError::Network(message)),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::Network("hang ended".into()))
            }
        }
    }
}

/// Provider answer with all components and a matching total
pub fn reading_json(digital: u64, sub_unit: u8, dial: f64, confidence: &str) -> String {
    let total = Reading::component_sum(digital, Some(sub_unit), Some(dial));
    json!({
        "digital_reading": digital,
        "sub_unit_reading": sub_unit,
        "dial_reading": dial,
        "total_reading": total,
        "confidence": confidence,
        "notes": "clear image"
    })
    .to_string()
}

pub fn chain_of(providers: &[Arc<ScriptedProvider>]) -> ProviderChain {
    ProviderChain::new(
        providers
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn VisionProvider>)
            .collect(),
        TEST_PROVIDER_TIMEOUT,
    )
}

// ============================================================================
// Camera
// ============================================================================

/// Camera returning the same bytes for every meter
pub struct StaticCapture {
    image: Vec<u8>,
    captures: AtomicUsize,
}

impl StaticCapture {
    pub fn new(image: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            image: image.to_vec(),
            captures: AtomicUsize::new(0),
        })
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CaptureSource for StaticCapture {
    async fn capture(&self, _meter_name: &str) -> Result<Vec<u8>, PipelineError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(self.image.clone())
    }

    fn source_for(&self, meter_name: &str) -> String {
        format!("test://{}", meter_name)
    }
}

// ============================================================================
// Time-series sink
// ============================================================================

/// Sink that remembers every point it receives
#[derive(Default)]
pub struct RecordingSink {
    points: Mutex<Vec<(String, MeterType, f64, DateTime<Utc>)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn points(&self) -> Vec<(String, MeterType, f64, DateTime<Utc>)> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TimeSeriesSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn write(
        &self,
        reading: &Reading,
        meter_name: &str,
        meter_type: MeterType,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.points.lock().unwrap().push((
            meter_name.to_string(),
            meter_type,
            reading.total_reading(),
            timestamp,
        ));
        Ok(())
    }
}

/// Sink whose database is unreachable
pub struct FailingSink;

#[async_trait::async_trait]
impl TimeSeriesSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn write(
        &self,
        _reading: &Reading,
        _meter_name: &str,
        _meter_type: MeterType,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("connection refused".into()))
    }
}

/// Sink that never answers
pub struct HangingSink;

#[async_trait::async_trait]
impl TimeSeriesSink for HangingSink {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn write(
        &self,
        _reading: &Reading,
        _meter_name: &str,
        _meter_type: MeterType,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub fn meter(name: &str, meter_type: MeterType) -> MeterSection {
    MeterSection {
        name: name.to_string(),
        meter_type,
        camera_url: format!("test://{}", name),
        rotation: 0,
        interval_secs: 600,
        jump_threshold: None,
        has_sub_unit_wheel: true,
        has_dial: true,
        unit: None,
        camera_timeout_secs: 1,
    }
}

/// Unrotated JPEG snapshot taken now
pub fn snapshot(meter_name: &str, meter_type: MeterType) -> Snapshot {
    Snapshot {
        meter_name: meter_name.to_string(),
        meter_type,
        captured_at: Utc::now(),
        image: JPEG.to_vec(),
        rotation: Rotation::None,
        camera_source: format!("test://{}", meter_name),
    }
}

/// Orchestrator wired to fakes, rooted in a temp directory
pub struct TestPipeline {
    pub temp_dir: TempDir,
    pub layout: RootFolderInitializer,
    pub orchestrator: Arc<Orchestrator>,
    pub events: mpsc::Receiver<PipelineEvent>,
}

impl TestPipeline {
    pub fn new(
        meters: Vec<MeterSection>,
        providers: &[Arc<ScriptedProvider>],
        capture: Arc<dyn CaptureSource>,
        sink: Arc<dyn TimeSeriesSink>,
    ) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let layout = RootFolderInitializer::new(temp_dir.path().to_path_buf());
        layout.ensure_directory_exists().unwrap();

        let settings = PipelineSettings {
            sink_timeout: Duration::from_millis(200),
            ..PipelineSettings::default()
        };
        let chain =
            chain_of(providers).with_ledger(Arc::new(AttemptLedger::new(layout.attempts_path())));

        // Large enough that unread events never block a run
        let (event_tx, events) = mpsc::channel(10_000);
        let orchestrator = Orchestrator::new(
            meters,
            settings,
            chain,
            capture,
            ArchiveStore::new(layout.archive_dir()),
            ReadingLog::new(layout.log_dir()),
            sink,
        )
        .unwrap()
        .with_events(event_tx);

        Self {
            temp_dir,
            layout,
            orchestrator: Arc::new(orchestrator),
            events,
        }
    }

    /// Single water meter, static JPEG camera, recording sink
    pub fn water(providers: &[Arc<ScriptedProvider>]) -> (Self, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let pipeline = Self::new(
            vec![meter("water_main", MeterType::Water)],
            providers,
            StaticCapture::new(JPEG),
            sink.clone(),
        );
        (pipeline, sink)
    }

    /// Second orchestrator over the same root folder, as after a restart
    /// with a changed configuration
    pub fn reopen(
        &self,
        meters: Vec<MeterSection>,
        providers: &[Arc<ScriptedProvider>],
    ) -> Orchestrator {
        Orchestrator::new(
            meters,
            PipelineSettings::default(),
            chain_of(providers),
            StaticCapture::new(JPEG),
            ArchiveStore::new(self.layout.archive_dir()),
            ReadingLog::new(self.layout.log_dir()),
            RecordingSink::new(),
        )
        .unwrap()
    }

    /// Events received so far
    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Count of regular files (excluding temp files) in a directory tree
    pub fn file_count(&self) -> usize {
        count_files(self.layout.root())
    }
}

fn count_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Encode a blank PNG of the given size
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::new(width, height);
    let mut bytes = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

/// Decoded dimensions of an encoded image
pub fn dimensions(bytes: &[u8]) -> (u32, u32) {
    let image = image::load_from_memory(bytes).unwrap();
    (image.width(), image.height())
}
