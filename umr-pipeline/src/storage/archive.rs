//! Snapshot archive
//!
//! Layout: `<base>/<meter_name>/<meter_name>_<YYYYMMDD_HHMMSS>[_n].<ext>` with a
//! `.json` metadata file sharing the same stem. The stem is the archive id.
//!
//! # Write ordering
//! 1. Image written to a temp file, fsynced, renamed into place, dir fsynced
//! 2. Metadata written the same way, only after step 1 is durable
//!
//! A crash between the two steps leaves an image without metadata. Readers
//! only enumerate metadata files, so such residue is invisible until
//! [`ArchiveStore::sweep`] removes it. Deletion runs in the reverse order
//! (metadata first), so a metadata file never points at a missing image.

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use umr_common::fs::{atomic_write, is_temp_file, sha256_hex, sync_dir};
use umr_common::time::timestamp_stem;

use crate::chain::ProviderChain;
use crate::error::PipelineError;
use crate::providers::TranscriptionHints;
use crate::types::{
    ArchiveMetadata, ArchivedSnapshot, CameraInfo, LogEntry, Reading, Snapshot, SnapshotInfo,
};
use crate::validator::ReadingValidator;

const METADATA_EXT: &str = "json";

/// Holding area for entries set aside by reconciliation
///
/// Meter names never start with a dot, so this cannot collide with a meter
/// directory.
const QUARANTINE_DIR: &str = ".quarantine";

/// Image durably written, metadata still pending
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub meter_name: String,
    pub id: String,
    pub filename: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Per-meter image + metadata archive
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    base_dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn meter_dir(&self, meter_name: &str) -> PathBuf {
        self.base_dir.join(meter_name)
    }

    /// Archive a snapshot with its reading
    ///
    /// Returns the archived pair once both files are durable.
    pub async fn archive(
        &self,
        snapshot: &Snapshot,
        reading: &Reading,
        validation_warning: Option<String>,
    ) -> Result<ArchivedSnapshot, PipelineError> {
        let staged = self
            .write_image(&snapshot.meter_name, snapshot.captured_at, &snapshot.image)
            .await?;

        let metadata = ArchiveMetadata {
            snapshot: SnapshotInfo {
                filename: staged.filename.clone(),
                timestamp: snapshot.captured_at,
                meter_name: snapshot.meter_name.clone(),
                meter_type: snapshot.meter_type,
                rotation: snapshot.rotation,
                media_type: crate::image_ops::media_type(&snapshot.image).to_string(),
                image_sha256: staged.sha256.clone(),
                size_bytes: staged.size_bytes,
            },
            meter_reading: reading.clone(),
            validation_warning,
            camera: CameraInfo {
                source: snapshot.camera_source.clone(),
            },
            reanalyzed_at: None,
        };

        let archived = self.write_metadata(&staged, metadata).await?;
        info!(
            meter = %snapshot.meter_name,
            archive_id = %archived.id,
            path = %archived.archive_path.display(),
            "Snapshot archived"
        );
        Ok(archived)
    }

    /// Step 1: durably write the image under a fresh, collision-free stem
    pub async fn write_image(
        &self,
        meter_name: &str,
        captured_at: DateTime<Utc>,
        image: &[u8],
    ) -> Result<StagedImage, PipelineError> {
        validate_component(meter_name)?;
        let dir = self.meter_dir(meter_name);
        let meter_name = meter_name.to_string();
        let image = image.to_vec();

        blocking(move || {
            fs::create_dir_all(&dir)?;

            let ext = crate::image_ops::extension(&image);
            let base = format!("{}_{}", meter_name, timestamp_stem(&captured_at));
            let mut id = base.clone();
            let mut n = 0u32;
            while dir.join(format!("{}.{}", id, ext)).exists()
                || dir.join(format!("{}.{}", id, METADATA_EXT)).exists()
            {
                n += 1;
                id = format!("{}_{}", base, n);
            }

            let filename = format!("{}.{}", id, ext);
            let path = dir.join(&filename);
            atomic_write(&path, &image)?;
            debug!(path = %path.display(), bytes = image.len(), "Archive image written");

            Ok(StagedImage {
                meter_name,
                id,
                filename,
                path,
                sha256: sha256_hex(&image),
                size_bytes: image.len() as u64,
            })
        })
        .await
        .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))
    }

    /// Step 2: durably write metadata for a staged image
    pub async fn write_metadata(
        &self,
        staged: &StagedImage,
        metadata: ArchiveMetadata,
    ) -> Result<ArchivedSnapshot, PipelineError> {
        let path = self.metadata_path(&staged.meter_name, &staged.id);
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))?;

        blocking(move || atomic_write(&path, &json))
            .await
            .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))?;

        Ok(ArchivedSnapshot {
            id: staged.id.clone(),
            archive_path: staged.path.clone(),
            metadata,
        })
    }

    /// Archived snapshots for a meter, newest first
    ///
    /// Metadata files whose image is missing or that fail to parse are
    /// skipped with a warning.
    pub async fn list(
        &self,
        meter_name: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ArchivedSnapshot>, PipelineError> {
        validate_component(meter_name)?;
        let dir = self.meter_dir(meter_name);

        let mut entries = blocking(move || {
            let mut found = Vec::new();
            let read_dir = match fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
                Err(e) => return Err(e),
            };

            for entry in read_dir {
                let path = entry?.path();
                if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXT) {
                    continue;
                }
                match load_entry(&path) {
                    Ok(Some(archived)) => found.push(archived),
                    Ok(None) => warn!(path = %path.display(), "Metadata references missing image, skipping"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Unreadable metadata, skipping"),
                }
            }
            Ok(found)
        })
        .await
        .map_err(|e| PipelineError::ArchiveRead(e.to_string()))?;

        entries.sort_by(|a, b| {
            b.metadata
                .snapshot
                .timestamp
                .cmp(&a.metadata.snapshot.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Most recent archived snapshot for a meter
    pub async fn latest(&self, meter_name: &str) -> Result<Option<ArchivedSnapshot>, PipelineError> {
        Ok(self.list(meter_name, Some(1)).await?.into_iter().next())
    }

    /// Load one archived snapshot by id
    pub async fn get(&self, meter_name: &str, id: &str) -> Result<ArchivedSnapshot, PipelineError> {
        validate_component(meter_name)?;
        validate_component(id)?;
        let path = self.metadata_path(meter_name, id);
        let label = format!("{}/{}", meter_name, id);

        let loaded = blocking(move || match load_entry(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            other => other,
        })
        .await
        .map_err(|e| PipelineError::ArchiveRead(e.to_string()))?;

        loaded.ok_or_else(|| PipelineError::NotFound(format!("archive entry {}", label)))
    }

    /// Read the archived image bytes
    pub async fn read_image(&self, archived: &ArchivedSnapshot) -> Result<Vec<u8>, PipelineError> {
        tokio::fs::read(&archived.archive_path)
            .await
            .map_err(|e| PipelineError::ArchiveRead(format!("{}: {}", archived.archive_path.display(), e)))
    }

    /// Re-check the image against its recorded checksum
    pub async fn verify(&self, meter_name: &str, id: &str) -> Result<bool, PipelineError> {
        let archived = self.get(meter_name, id).await?;
        let bytes = self.read_image(&archived).await?;
        Ok(sha256_hex(&bytes) == archived.metadata.snapshot.image_sha256)
    }

    /// Overwrite the metadata of an existing entry
    ///
    /// Used by re-analysis; the image is never touched.
    pub async fn replace_metadata(
        &self,
        meter_name: &str,
        id: &str,
        metadata: &ArchiveMetadata,
    ) -> Result<(), PipelineError> {
        validate_component(meter_name)?;
        validate_component(id)?;
        let path = self.metadata_path(meter_name, id);
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))?;

        blocking(move || atomic_write(&path, &json))
            .await
            .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))
    }

    /// Re-run transcription on an archived image
    ///
    /// Applies the rotation recorded at capture time, replaces the reading
    /// and its validation warning, and stamps `reanalyzed_at`. `history`
    /// holds the meter's log entries captured before this snapshot. The
    /// snapshot section (timestamp, filename, checksum) is left untouched.
    pub async fn reanalyze(
        &self,
        mut archived: ArchivedSnapshot,
        chain: &ProviderChain,
        hints: &TranscriptionHints,
        validator: &ReadingValidator,
        history: &[LogEntry],
    ) -> Result<ArchivedSnapshot, PipelineError> {
        let meter_name = archived.metadata.snapshot.meter_name.clone();
        let id = archived.id.clone();
        let image = self.read_image(&archived).await?;

        let rotation = archived.metadata.snapshot.rotation;
        let rotated = tokio::task::spawn_blocking(move || {
            crate::image_ops::rotate(&image, rotation).map(|bytes| bytes.into_owned())
        })
        .await
        .map_err(|e| PipelineError::Image(e.to_string()))??;
        let media_type = crate::image_ops::media_type(&rotated);

        let transcription = chain.transcribe(&rotated, media_type, hints).await?;

        let previous_total = archived.metadata.meter_reading.total_reading();
        archived.metadata.validation_warning = validator
            .validate(&transcription.reading, history)
            .warning()
            .map(|w| w.to_string());
        archived.metadata.meter_reading = transcription.reading;
        archived.metadata.reanalyzed_at = Some(Utc::now());
        self.replace_metadata(&meter_name, &id, &archived.metadata).await?;

        info!(
            meter = %meter_name,
            archive_id = %id,
            previous_total,
            new_total = archived.metadata.meter_reading.total_reading(),
            "Archive entry re-analyzed"
        );
        Ok(archived)
    }

    /// Remove an entry: metadata first, then image
    pub async fn delete(&self, meter_name: &str, id: &str) -> Result<(), PipelineError> {
        validate_component(meter_name)?;
        validate_component(id)?;
        let dir = self.meter_dir(meter_name);
        let metadata_path = self.metadata_path(meter_name, id);
        let id_owned = id.to_string();

        let removed = blocking(move || {
            let image_path = match fs::read(&metadata_path) {
                Ok(bytes) => serde_json::from_slice::<ArchiveMetadata>(&bytes)
                    .ok()
                    .map(|m| dir.join(m.snapshot.filename)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            let image_path = match image_path {
                Some(p) => Some(p),
                None => find_image(&dir, &id_owned)?,
            };

            let mut removed = false;
            match fs::remove_file(&metadata_path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            if let Some(image_path) = image_path {
                match fs::remove_file(&image_path) {
                    Ok(()) => removed = true,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            if removed {
                sync_dir(&dir)?;
            }
            Ok(removed)
        })
        .await
        .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))?;

        if !removed {
            return Err(PipelineError::NotFound(format!(
                "archive entry {}/{}",
                meter_name, id
            )));
        }
        info!(meter = %meter_name, archive_id = %id, "Archive entry deleted");
        Ok(())
    }

    /// Move an entry out of the archive into the quarantine area
    ///
    /// The image moves first, so a crash in between leaves metadata that
    /// readers skip rather than an image that [`ArchiveStore::sweep`] would
    /// delete. Returns the directory now holding the pair.
    pub async fn quarantine(&self, meter_name: &str, id: &str) -> Result<PathBuf, PipelineError> {
        let archived = self.get(meter_name, id).await?;
        let source_dir = self.meter_dir(meter_name);
        let target_dir = self.quarantine_dir(meter_name);
        let metadata_path = self.metadata_path(meter_name, id);
        let metadata_name = format!("{}.{}", id, METADATA_EXT);
        let image_name = archived.metadata.snapshot.filename.clone();

        let moved_to = blocking(move || {
            fs::create_dir_all(&target_dir)?;
            fs::rename(&archived.archive_path, target_dir.join(&image_name))?;
            fs::rename(&metadata_path, target_dir.join(&metadata_name))?;
            sync_dir(&target_dir)?;
            sync_dir(&source_dir)?;
            Ok(target_dir)
        })
        .await
        .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))?;

        warn!(
            meter = %meter_name,
            archive_id = %id,
            path = %moved_to.display(),
            "Archive entry quarantined"
        );
        Ok(moved_to)
    }

    pub fn quarantine_dir(&self, meter_name: &str) -> PathBuf {
        self.base_dir.join(QUARANTINE_DIR).join(meter_name)
    }

    /// Remove crash residue: temp files and images without metadata
    ///
    /// Returns the number of files removed.
    pub async fn sweep(&self, meter_name: &str) -> Result<usize, PipelineError> {
        validate_component(meter_name)?;
        let dir = self.meter_dir(meter_name);

        let removed = blocking(move || {
            let read_dir = match fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e),
            };

            let mut removed = 0;
            for entry in read_dir {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let orphan = if is_temp_file(&path) {
                    true
                } else if path.extension().and_then(|e| e.to_str()) == Some(METADATA_EXT) {
                    false
                } else {
                    !path.with_extension(METADATA_EXT).exists()
                };
                if orphan {
                    fs::remove_file(&path)?;
                    warn!(path = %path.display(), "Removed archive residue");
                    removed += 1;
                }
            }
            if removed > 0 {
                sync_dir(&dir)?;
            }
            Ok(removed)
        })
        .await
        .map_err(|e| PipelineError::ArchiveWrite(e.to_string()))?;

        Ok(removed)
    }

    fn metadata_path(&self, meter_name: &str, id: &str) -> PathBuf {
        self.meter_dir(meter_name)
            .join(format!("{}.{}", id, METADATA_EXT))
    }
}

/// Parse a metadata file; `None` when its image is missing
fn load_entry(metadata_path: &Path) -> io::Result<Option<ArchivedSnapshot>> {
    let bytes = fs::read(metadata_path)?;
    let metadata: ArchiveMetadata = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let dir = metadata_path.parent().unwrap_or_else(|| Path::new("."));
    let image_path = dir.join(&metadata.snapshot.filename);
    if !image_path.is_file() {
        return Ok(None);
    }

    let id = metadata_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    Ok(Some(ArchivedSnapshot {
        id,
        archive_path: image_path,
        metadata,
    }))
}

/// Locate an image by stem when its metadata is gone
fn find_image(dir: &Path, id: &str) -> io::Result<Option<PathBuf>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for entry in read_dir {
        let path = entry?.path();
        let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(id);
        let is_metadata = path.extension().and_then(|e| e.to_str()) == Some(METADATA_EXT);
        if stem_matches && !is_metadata && !is_temp_file(&path) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Reject names that would escape the archive directory
fn validate_component(name: &str) -> Result<(), PipelineError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(PipelineError::InvalidInput(format!(
            "invalid archive path component '{}'",
            name
        )));
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
