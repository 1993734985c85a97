use std::path::PathBuf;

/// Error taxonomy shared by the document store, caches, and task engine.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Missing catalog file, record, task, or backup.
    #[error("not found: {0}")]
    NotFound(String),
    /// Document operation attempted before `load`.
    #[error("database not loaded")]
    NotLoaded,
    /// Malformed or unsafe document, or unreadable persisted state.
    #[error("corrupt {what}: {detail}")]
    Corrupt { what: String, detail: String },
    /// Field value outside its allowed domain.
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    /// Subprocess missing, non-zero exit, or timeout.
    #[error("external tool failure: {0}")]
    ExternalToolFailure(String),
    /// Retryable lookup failure.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),
    /// Non-fatal failure of a single record's computation.
    #[error("{0}")]
    RecordComputeFailure(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// Map an I/O error to `NotFound` when the path is missing.
    pub(crate) fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.display().to_string())
        } else {
            Self::io(path, source)
        }
    }
}

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;
