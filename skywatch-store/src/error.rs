//! Error type for the storage engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupted backup {path}: {reason}")]
    CorruptedBackup { path: PathBuf, reason: String },
    #[error("legacy store not found: {0}")]
    LegacyMissing(PathBuf),
    #[error("migration has not completed")]
    MigrationIncomplete,
    #[error("engine task has stopped")]
    EngineStopped,
    #[error("no encounter with id {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
