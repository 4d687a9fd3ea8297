//! Local run history.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::controller::RunStatus;
use crate::errors::HistoryError;

/// One finished run, recorded on every terminal transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cost: Option<f64>,
    pub token_count: u64,
    pub route: String,
    pub session_id: String,
    pub org: String,
    /// Scenario parameters; only filled when parameter reporting is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Receives run summaries.
pub trait RunHistory: Send + Sync {
    fn record(&self, summary: RunSummary) -> Result<(), HistoryError>;
}

/// Keeps summaries in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemoryRunHistory {
    runs: Mutex<Vec<RunSummary>>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RunHistory for MemoryRunHistory {
    fn record(&self, summary: RunSummary) -> Result<(), HistoryError> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(summary);
        Ok(())
    }
}

/// Appends summaries to a JSON-lines file.
#[derive(Debug)]
pub struct JsonlRunHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlRunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every recorded summary back. A missing file is an empty history.
    pub fn load(&self) -> Result<Vec<RunSummary>, HistoryError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(HistoryError::from))
            .collect()
    }
}

impl RunHistory for JsonlRunHistory {
    fn record(&self, summary: RunSummary) -> Result<(), HistoryError> {
        let line = serde_json::to_string(&summary)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
