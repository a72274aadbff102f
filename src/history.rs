//! Append-only log of looked-up words.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::HistoryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub word: String,
    pub looked_up_at: DateTime<Utc>,
}

/// Word history kept as JSON lines on disk, or in memory when no path is set.
#[derive(Clone)]
pub struct HistoryLog {
    shared: Arc<HistoryShared>,
}

struct HistoryShared {
    path: Option<PathBuf>,
    memory: Mutex<Vec<HistoryEntry>>,
}

impl HistoryLog {
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self::with_path(Some(path.into()))
    }

    pub fn ephemeral() -> Self {
        Self::with_path(None)
    }

    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(HistoryShared {
                path,
                memory: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn record(&self, word: &str) -> Result<(), HistoryError> {
        let word = word.trim();
        if word.is_empty() {
            return Ok(());
        }
        let entry = HistoryEntry {
            word: word.to_string(),
            looked_up_at: Utc::now(),
        };
        // Held across the file write so appends from concurrent requests do not interleave.
        let mut memory = self.shared.memory.lock();
        let Some(path) = &self.shared.path else {
            memory.push(entry);
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let memory = self.shared.memory.lock();
        let Some(path) = &self.shared.path else {
            return Ok(memory.clone());
        };
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = idx + 1, error = %err, "skipping malformed history line"),
            }
        }
        Ok(entries)
    }

    /// Words, most recent first.
    pub fn read(&self) -> Result<Vec<String>, HistoryError> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .map(|entry| entry.word)
            .collect())
    }

    pub fn clear(&self) -> Result<(), HistoryError> {
        let mut memory = self.shared.memory.lock();
        memory.clear();
        if let Some(path) = &self.shared.path {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// `word,looked_up_at` rows, oldest first.
    pub fn export_csv(&self) -> Result<String, HistoryError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["word", "looked_up_at"])?;
        for entry in self.entries()? {
            let stamp = entry.looked_up_at.to_rfc3339();
            writer.write_record([entry.word.as_str(), stamp.as_str()])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| HistoryError::Io(err.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
