//! Error types shared by the rendering engine and its collaborators.

use std::io;

use thiserror::Error;

/// Failures surfaced while rendering a word.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The requested dictionary id is not installed.
    #[error("dictionary '{0}' is not installed")]
    SourceNotFound(String),

    /// Alias records kept pointing at words already visited.
    #[error("alias chain for '{word}' in dictionary '{source_id}' loops or is too deep")]
    RedirectCycle { word: String, source_id: String },

    /// The query word was blank after trimming.
    #[error("query word is empty")]
    EmptyWord,
}

/// Failures while loading a dictionary directory.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid dictionary metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("headword index error: {0}")]
    Index(#[from] fst::Error),

    #[error("invalid dictionary format: {0}")]
    InvalidFormat(String),
}

/// Failures while serving a dictionary resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("dictionary '{0}' is not installed")]
    SourceNotFound(String),

    #[error("resource '{0}' not found")]
    NotFound(String),

    #[error("Error: {path} - {reason}")]
    Stylesheet { path: String, reason: String },
}

/// Failures of the lookup history log.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("history entry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;
