//! Provider attempt ledger (`provider_attempts.jsonl`)

use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::chain::AttemptRecord;
use crate::error::PipelineError;

/// Append-only JSONL record of every provider attempt
pub struct AttemptLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AttemptLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn append(&self, attempt: &AttemptRecord) -> Result<(), PipelineError> {
        let mut line =
            serde_json::to_vec(attempt).map_err(|e| PipelineError::LogWrite(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(&line)
        })
        .await
        .map_err(|e| PipelineError::LogWrite(e.to_string()))?
        .map_err(|e| PipelineError::LogWrite(format!("{}: {}", self.path.display(), e)))
    }

    /// All recorded attempts, skipping unparseable lines
    pub async fn read_all(&self) -> Result<Vec<AttemptRecord>, PipelineError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::LogRead(e.to_string())),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::AttemptOutcome;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = AttemptLedger::new(temp_dir.path().join("logs").join("provider_attempts.jsonl"));

        let attempt = AttemptRecord {
            provider_id: "gemini".into(),
            provider_model: "gemini-2.5-flash".into(),
            meter_name: "water_main".into(),
            started_at: Utc::now(),
            latency_ms: 812,
            outcome: AttemptOutcome::Timeout,
            error: Some("Timed out after 30s".into()),
            usage: None,
        };
        ledger.append(&attempt).await.unwrap();
        ledger.append(&attempt).await.unwrap();

        let all = ledger.read_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], attempt);
    }
}
