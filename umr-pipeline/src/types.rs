//! Core types for the reading pipeline
//!
//! Defines the data that flows through one pipeline run:
//! - **Reading:** validated transcription of a meter display
//! - **Snapshot:** one capture event (image bytes + identity)
//! - **ArchiveMetadata / ArchivedSnapshot:** what the archive persists
//! - **LogEntry:** one line of a per-type reading log
//!
//! A `Reading` can only be built through [`Reading::checked`] or
//! [`Reading::new`], so every instance in the system satisfies the
//! derived-total invariant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use umr_common::MeterType;
use uuid::Uuid;

/// Allowed difference between a supplied total and the component sum
pub const TOTAL_TOLERANCE: f64 = 1e-6;

/// Largest digital component; every integer up to 2^53 is exact in an f64 total
pub const MAX_DIGITAL: u64 = 1 << 53;

// ============================================================================
// Reading
// ============================================================================

/// Invariant violations rejected at Reading construction
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReadingError {
    #[error("digital component {0} exceeds 2^53")]
    DigitalOutOfRange(u64),

    #[error("sub-unit component must be a single digit 0-9 (got {0})")]
    SubUnitOutOfRange(u8),

    #[error("dial component must be in [0, 1) (got {0})")]
    DialOutOfRange(f64),

    #[error("total reading {supplied} does not match component sum {derived}")]
    TotalMismatch { supplied: f64, derived: f64 },

    #[error("reading contains a non-finite value")]
    NonFinite,

    #[error("invalid confidence '{0}' (expected high, medium or low)")]
    InvalidConfidence(String),
}

/// Provider-declared confidence in a transcription
///
/// Informational only: the chain never re-verifies it and the validator
/// never changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Confidence {
    type Err = ReadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            _ => Err(ReadingError::InvalidConfidence(s.to_string())),
        }
    }
}

/// Token accounting reported by a provider (opaque to the pipeline)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl ApiUsage {
    pub fn new(input_tokens: Option<u64>, output_tokens: Option<u64>) -> Self {
        let total_tokens = match (input_tokens, output_tokens) {
            (Some(i), Some(o)) => Some(i + o),
            _ => None,
        };
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// Canonical transcription result for one capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReadingRecord", into = "ReadingRecord")]
pub struct Reading {
    digital_component: u64,
    sub_unit_component: Option<u8>,
    dial_component: Option<f64>,
    total_reading: f64,
    confidence: Confidence,
    notes: Option<String>,
    provider_id: String,
    provider_model: String,
    api_usage: Option<ApiUsage>,
}

impl Reading {
    /// Build a reading whose total is derived from its components
    pub fn new(
        digital: u64,
        sub_unit: Option<u8>,
        dial: Option<f64>,
        confidence: Confidence,
    ) -> Result<Self, ReadingError> {
        Self::checked(digital, sub_unit, dial, None, confidence)
    }

    /// Build a reading, checking a supplied total against the component sum
    pub fn checked(
        digital: u64,
        sub_unit: Option<u8>,
        dial: Option<f64>,
        total: Option<f64>,
        confidence: Confidence,
    ) -> Result<Self, ReadingError> {
        if digital > MAX_DIGITAL {
            return Err(ReadingError::DigitalOutOfRange(digital));
        }
        if let Some(digit) = sub_unit {
            if digit > 9 {
                return Err(ReadingError::SubUnitOutOfRange(digit));
            }
        }
        if let Some(dial) = dial {
            if !dial.is_finite() {
                return Err(ReadingError::NonFinite);
            }
            if !(0.0..1.0).contains(&dial) {
                return Err(ReadingError::DialOutOfRange(dial));
            }
        }

        let derived = Self::component_sum(digital, sub_unit, dial);
        let total_reading = match total {
            Some(supplied) if !supplied.is_finite() => return Err(ReadingError::NonFinite),
            Some(supplied) if (supplied - derived).abs() > TOTAL_TOLERANCE => {
                return Err(ReadingError::TotalMismatch { supplied, derived })
            }
            Some(supplied) => supplied,
            None => derived,
        };

        Ok(Self {
            digital_component: digital,
            sub_unit_component: sub_unit,
            dial_component: dial,
            total_reading,
            confidence,
            notes: None,
            provider_id: String::new(),
            provider_model: String::new(),
            api_usage: None,
        })
    }

    /// digital + sub_unit·0.1 + dial
    pub fn component_sum(digital: u64, sub_unit: Option<u8>, dial: Option<f64>) -> f64 {
        digital as f64 + sub_unit.map_or(0.0, |d| f64::from(d) * 0.1) + dial.unwrap_or(0.0)
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn with_provider(mut self, id: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider_id = id.into();
        self.provider_model = model.into();
        self
    }

    pub fn with_usage(mut self, usage: Option<ApiUsage>) -> Self {
        self.api_usage = usage.filter(|u| !u.is_empty());
        self
    }

    pub fn digital_component(&self) -> u64 {
        self.digital_component
    }

    pub fn sub_unit_component(&self) -> Option<u8> {
        self.sub_unit_component
    }

    pub fn dial_component(&self) -> Option<f64> {
        self.dial_component
    }

    pub fn total_reading(&self) -> f64 {
        self.total_reading
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn provider_model(&self) -> &str {
        &self.provider_model
    }

    pub fn api_usage(&self) -> Option<&ApiUsage> {
        self.api_usage.as_ref()
    }
}

/// Serialized form of [`Reading`]; deserialization re-checks the invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReadingRecord {
    digital_reading: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_unit_reading: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dial_reading: Option<f64>,
    total_reading: f64,
    confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    #[serde(default)]
    provider_id: String,
    #[serde(default)]
    provider_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_usage: Option<ApiUsage>,
}

impl TryFrom<ReadingRecord> for Reading {
    type Error = ReadingError;

    fn try_from(r: ReadingRecord) -> Result<Self, Self::Error> {
        Ok(Reading::checked(
            r.digital_reading,
            r.sub_unit_reading,
            r.dial_reading,
            Some(r.total_reading),
            r.confidence,
        )?
        .with_notes(r.notes)
        .with_provider(r.provider_id, r.provider_model)
        .with_usage(r.api_usage))
    }
}

impl From<Reading> for ReadingRecord {
    fn from(r: Reading) -> Self {
        Self {
            digital_reading: r.digital_component,
            sub_unit_reading: r.sub_unit_component,
            dial_reading: r.dial_component,
            total_reading: r.total_reading,
            confidence: r.confidence,
            notes: r.notes,
            provider_id: r.provider_id,
            provider_model: r.provider_model,
            api_usage: r.api_usage,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Clockwise rotation applied to a capture before transcription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(format!(
                "rotation must be 0, 90, 180 or 270 degrees (got {})",
                other
            )),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(r: Rotation) -> Self {
        r.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// One capture event, owned by the orchestrator for the duration of a run
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub meter_name: String,
    pub meter_type: MeterType,
    pub captured_at: DateTime<Utc>,
    /// Bytes as captured (before rotation)
    pub image: Vec<u8>,
    pub rotation: Rotation,
    /// Camera reference the bytes came from
    pub camera_source: String,
}

// ============================================================================
// Archive metadata
// ============================================================================

/// `snapshot` section of an archive metadata file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Image file name inside the meter's archive directory
    pub filename: String,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    pub meter_name: String,
    pub meter_type: MeterType,
    #[serde(rename = "rotation_degrees")]
    pub rotation: Rotation,
    pub media_type: String,
    pub image_sha256: String,
    pub size_bytes: u64,
}

/// `camera` section of an archive metadata file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub source: String,
}

/// Contents of one archive metadata file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub snapshot: SnapshotInfo,
    pub meter_reading: Reading,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_warning: Option<String>,
    pub camera: CameraInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reanalyzed_at: Option<DateTime<Utc>>,
}

/// Archived image + metadata pair as seen by readers
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedSnapshot {
    /// Shared stem of the image and metadata files
    pub id: String,
    /// Path of the archived image
    pub archive_path: std::path::PathBuf,
    pub metadata: ArchiveMetadata,
}

// ============================================================================
// Reading log
// ============================================================================

/// One line of a per-meter-type reading log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: Uuid,
    /// Capture time of the snapshot this reading came from
    pub timestamp: DateTime<Utc>,
    pub meter_name: String,
    pub meter_type: MeterType,
    pub archive_id: String,
    pub image_filename: String,
    #[serde(flatten)]
    pub reading: Reading,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_warning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_is_derived_from_components() {
        let reading = Reading::new(2271, Some(8), Some(0.017), Confidence::Medium).unwrap();
        assert!((reading.total_reading() - 2271.817).abs() < TOTAL_TOLERANCE);
    }

    #[test]
    fn test_supplied_total_must_match_sum() {
        let ok = Reading::checked(2271, None, Some(0.5), Some(2271.5), Confidence::High);
        assert!(ok.is_ok());

        let err = Reading::checked(2271, None, Some(0.5), Some(2272.5), Confidence::High);
        assert!(matches!(err, Err(ReadingError::TotalMismatch { .. })));
    }

    #[test]
    fn test_component_ranges_enforced() {
        assert!(Reading::new(MAX_DIGITAL, None, None, Confidence::Low).is_ok());
        assert_eq!(
            Reading::new(MAX_DIGITAL + 1, None, None, Confidence::Low),
            Err(ReadingError::DigitalOutOfRange(MAX_DIGITAL + 1))
        );
        assert_eq!(
            Reading::new(1, Some(10), None, Confidence::Low),
            Err(ReadingError::SubUnitOutOfRange(10))
        );
        assert!(matches!(
            Reading::new(1, None, Some(1.0), Confidence::Low),
            Err(ReadingError::DialOutOfRange(_))
        ));
        assert!(matches!(
            Reading::new(1, None, Some(-0.1), Confidence::Low),
            Err(ReadingError::DialOutOfRange(_))
        ));
        assert_eq!(
            Reading::checked(1, None, None, Some(f64::NAN), Confidence::Low),
            Err(ReadingError::NonFinite)
        );
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_total() {
        let json = r#"{"digital_reading":100,"dial_reading":0.25,"total_reading":150.0,"confidence":"high"}"#;
        assert!(serde_json::from_str::<Reading>(json).is_err());

        let json = r#"{"digital_reading":100,"dial_reading":0.25,"total_reading":100.25,"confidence":"high"}"#;
        let reading: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(reading.digital_component(), 100);
        assert_eq!(reading.provider_id(), "");
    }

    #[test]
    fn test_log_entry_is_flat() {
        let reading = Reading::new(42, Some(3), None, Confidence::High)
            .unwrap()
            .with_provider("gemini", "gemini-2.5-flash");
        let entry = LogEntry {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            meter_name: "water_main".into(),
            meter_type: MeterType::Water,
            archive_id: "water_main_20261016_101500".into(),
            image_filename: "water_main_20261016_101500.jpg".into(),
            reading,
            validation_warning: Some("large jump".into()),
        };

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["digital_reading"], 42);
        assert_eq!(value["sub_unit_reading"], 3);
        assert_eq!(value["provider_id"], "gemini");
        assert_eq!(value["meter_type"], "water");

        let back: LogEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_rotation_serde_as_degrees() {
        assert_eq!(serde_json::to_string(&Rotation::Cw270).unwrap(), "270");
        assert_eq!(serde_json::from_str::<Rotation>("90").unwrap(), Rotation::Cw90);
        assert!(serde_json::from_str::<Rotation>("45").is_err());
    }

    #[test]
    fn test_confidence_parse() {
        assert_eq!("HIGH".parse::<Confidence>().unwrap(), Confidence::High);
        assert!("certain".parse::<Confidence>().is_err());
    }

    #[test]
    fn test_empty_usage_dropped() {
        let reading = Reading::new(1, None, None, Confidence::Low)
            .unwrap()
            .with_usage(Some(ApiUsage::default()));
        assert!(reading.api_usage().is_none());
    }
}
