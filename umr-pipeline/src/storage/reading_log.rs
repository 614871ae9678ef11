//! Append-only reading log
//!
//! One JSON object per line, one file per meter type
//! (`<log_dir>/<type>_readings.jsonl`). Appends are serialized per file and
//! fsynced before returning, so an acknowledged entry survives a crash.
//! The log is never rewritten; it is the source of truth for the
//! previous-reading lookups done before validation.

use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use umr_common::MeterType;

use crate::error::PipelineError;
use crate::types::LogEntry;

/// Result of a full pass over one log file
#[derive(Debug, Default)]
pub struct LogScan {
    /// Parsed entries with their 1-based line numbers, in append order
    pub entries: Vec<(usize, LogEntry)>,
    /// Line numbers that failed to parse
    pub malformed: Vec<usize>,
}

/// Per-meter-type JSONL log
pub struct ReadingLog {
    dir: PathBuf,
    /// One lock per meter type log file
    locks: [Mutex<()>; 3],
}

impl ReadingLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    /// Log file for a meter type
    pub fn path_for(&self, meter_type: MeterType) -> PathBuf {
        self.dir.join(format!("{}_readings.jsonl", meter_type))
    }

    /// Append exactly one entry to its meter type's log
    pub async fn append(&self, entry: &LogEntry) -> Result<(), PipelineError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| PipelineError::LogWrite(e.to_string()))?;
        line.push(b'\n');

        let path = self.path_for(entry.meter_type);
        let _guard = self.lock(entry.meter_type).lock().await;

        let write_path = path.clone();
        tokio::task::spawn_blocking(move || append_line(&write_path, &line))
            .await
            .map_err(|e| PipelineError::LogWrite(e.to_string()))?
            .map_err(|e| PipelineError::LogWrite(format!("{}: {}", path.display(), e)))?;

        debug!(
            meter = %entry.meter_name,
            log = %path.display(),
            archive_id = %entry.archive_id,
            "Reading log entry appended"
        );
        Ok(())
    }

    /// Last `n` entries for one meter, most recent last
    ///
    /// Reads the file backwards from the end and stops as soon as `n`
    /// matching entries are found.
    pub async fn recent(
        &self,
        meter_type: MeterType,
        meter_name: &str,
        n: usize,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        let meter_name = meter_name.to_string();
        self.tail(meter_type, n, move |e| e.meter_name == meter_name)
            .await
    }

    /// Last `n` entries for one meter captured strictly before `cutoff`
    pub async fn recent_before(
        &self,
        meter_type: MeterType,
        meter_name: &str,
        cutoff: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        let meter_name = meter_name.to_string();
        self.tail(meter_type, n, move |e| {
            e.meter_name == meter_name && e.timestamp < cutoff
        })
        .await
    }

    /// All parseable entries of a meter type's log, in append order
    ///
    /// Lines that fail to parse (e.g. a torn final line after a crash) are
    /// skipped with a warning.
    pub async fn entries(&self, meter_type: MeterType) -> Result<Vec<LogEntry>, PipelineError> {
        Ok(self
            .scan(meter_type)
            .await?
            .entries
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Full pass over a meter type's log, keeping track of damaged lines
    pub async fn scan(&self, meter_type: MeterType) -> Result<LogScan, PipelineError> {
        let path = self.path_for(meter_type);
        let _guard = self.lock(meter_type).lock().await;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogScan::default()),
            Err(e) => {
                return Err(PipelineError::LogRead(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut scan = LogScan::default();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => scan.entries.push((index + 1, entry)),
                Err(e) => {
                    warn!(
                        log = %path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping malformed reading log line"
                    );
                    scan.malformed.push(index + 1);
                }
            }
        }
        Ok(scan)
    }

    async fn tail<F>(
        &self,
        meter_type: MeterType,
        n: usize,
        keep: F,
    ) -> Result<Vec<LogEntry>, PipelineError>
    where
        F: FnMut(&LogEntry) -> bool + Send + 'static,
    {
        let path = self.path_for(meter_type);
        let _guard = self.lock(meter_type).lock().await;

        let read_path = path.clone();
        tokio::task::spawn_blocking(move || read_tail(&read_path, n, keep))
            .await
            .map_err(|e| PipelineError::LogRead(e.to_string()))?
            .map_err(|e| PipelineError::LogRead(format!("{}: {}", path.display(), e)))
    }

    fn lock(&self, meter_type: MeterType) -> &Mutex<()> {
        let index = match meter_type {
            MeterType::Water => 0,
            MeterType::Electric => 1,
            MeterType::Gas => 2,
        };
        &self.locks[index]
    }
}

/// Append one line and fsync, repairing a torn trailing line first
fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    if !ends_with_newline(&mut file)? {
        file.write_all(b"\n")?;
    }
    file.write_all(line)?;
    file.sync_data()
}

/// Read backwards in fixed-size chunks
const TAIL_CHUNK: u64 = 64 * 1024;

/// Last `n` entries accepted by `keep`, oldest first
///
/// Unparseable lines are skipped.
fn read_tail<F>(path: &Path, n: usize, mut keep: F) -> io::Result<Vec<LogEntry>>
where
    F: FnMut(&LogEntry) -> bool,
{
    let mut found = Vec::new();
    if n == 0 {
        return Ok(found);
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };

    let mut pos = file.metadata()?.len();
    // Start of a line whose beginning lies in an earlier chunk
    let mut carry: Vec<u8> = Vec::new();

    while pos > 0 && found.len() < n {
        let len = TAIL_CHUNK.min(pos);
        pos -= len;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; len as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&carry);

        let complete = if pos == 0 {
            carry = Vec::new();
            &chunk[..]
        } else {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    carry = chunk[..i].to_vec();
                    &chunk[i + 1..]
                }
                None => {
                    carry = chunk;
                    continue;
                }
            }
        };

        for line in complete.split(|&b| b == b'\n').rev() {
            if found.len() == n {
                break;
            }
            if let Some(entry) = parse_line(line) {
                if keep(&entry) {
                    found.push(entry);
                }
            }
        }
    }

    found.reverse();
    Ok(found)
}

fn parse_line(line: &[u8]) -> Option<LogEntry> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
