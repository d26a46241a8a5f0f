use std::path::PathBuf;
use thiserror::Error;

use crate::model::QcStatus;

#[derive(Error, Debug)]
pub enum DocQcError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("Remote QC error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Failures of the document-automation session.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Failed to start automation session: {0}")]
    SessionInit(String),

    #[error("Source document not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to open document '{path}': {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Failed to export '{path}': {reason}")]
    Export { path: PathBuf, reason: String },

    #[error("Rendition '{path}' is invalid: {reason}")]
    RenditionInvalid { path: PathBuf, reason: String },

    #[error("Automation session died: {0}")]
    SessionDead(String),

    #[error("Failed to shut down automation session: {0}")]
    Shutdown(String),

    #[error("Conversion queue is stopped")]
    QueueStopped,
}

impl ConversionError {
    /// Whether the error indicates the external process is gone and the
    /// session has to be rebuilt before the next conversion.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ConversionError::SessionDead(_) | ConversionError::SessionInit(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Watch folder does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Watch path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Watch folder '{path}' is not accessible: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Folder is already being watched: {0}")]
    AlreadyWatching(PathBuf),

    #[error("Failed to start watcher: {0}")]
    Notify(String),

    #[error("Directory scan failed for '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Illegal transition for record {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: QcStatus,
        to: QcStatus,
    },

    #[error("Illegal transition for batch {id}: {from} -> {to}")]
    IllegalBatchTransition {
        id: String,
        from: crate::model::BatchStatus,
        to: crate::model::BatchStatus,
    },

    #[error("Record {id} cannot be retried from status {status}")]
    RetryNotAllowed { id: String, status: QcStatus },

    #[error("Record {id} reached the retry limit ({limit})")]
    RetryLimitExceeded { id: String, limit: u32 },

    #[error("Batch {id} cannot be retried: {reason}")]
    BatchRetryNotAllowed { id: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(crate::db::DatabaseError::Sqlite(e))
    }
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to build archive '{path}': {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("Rendition missing for record {qc_id}: {path}")]
    RenditionMissing { qc_id: String, path: PathBuf },

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DocQcError>;
