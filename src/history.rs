//! Record of past transcriptions, kept as a JSON list on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const HISTORY_FILE_NAME: &str = "history.json";

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed history file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Source file name
    pub name: String,
    /// Local time, `%Y-%m-%d %H:%M`
    pub date: String,
    pub text: String,
    /// Plain-text export written alongside, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_file: Option<PathBuf>,
}

impl HistoryEntry {
    pub fn new(name: impl Into<String>, text: impl Into<String>, at: DateTime<Local>) -> Self {
        Self {
            name: name.into(),
            date: at.format("%Y-%m-%d %H:%M").to_string(),
            text: text.into(),
            text_file: None,
        }
    }

    pub fn with_text_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.text_file = Some(path.into());
        self
    }

    /// Current contents of the text export, falling back to the recorded text
    /// when the file was moved or deleted
    pub fn current_text(&self) -> String {
        self.text_file
            .as_deref()
            .and_then(|path| fs::read_to_string(path).ok())
            .unwrap_or_else(|| self.text.clone())
    }
}

/// Append-only history list
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `history.json` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(HISTORY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in insertion order. A missing file is an empty history.
    pub fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No history at {:?}", self.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&raw).map_err(|source| HistoryError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    pub fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.load()?;
        entries.push(entry);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&entries)?)?;
        fs::rename(&tmp, &self.path)?;

        info!("History now has {} entries ({:?})", entries.len(), self.path);
        Ok(())
    }

    pub fn entries_newest_first(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = self.load()?;
        entries.reverse();
        Ok(entries)
    }
}
