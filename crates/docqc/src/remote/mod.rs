//! Client side of the remote QC service.
//!
//! The pipeline only talks to [`QcApi`]; [`HttpQcApi`] is the production
//! implementation and tests substitute their own.

pub mod http;
#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{BatchManifest, IssueCounts};

pub use http::HttpQcApi;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("QC service returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Failed to decode QC service response: {0}")]
    Decode(String),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Client errors other than rate limiting will not succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RemoteError::Status { code, .. } if (400..500).contains(code) && *code != 429)
    }
}

/// Remote job id assigned to one archive entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobAssignment {
    pub entry_name: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResponse {
    pub batch_id: String,
    #[serde(default)]
    pub jobs: Vec<JobAssignment>,
}

/// Per-file state reported by the QC service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Processing,
    Completed,
    Failed,
    NumberingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileVerdict {
    pub entry_name: String,
    #[serde(default)]
    pub job_id: Option<String>,
    pub state: FileState,
    #[serde(default)]
    pub issues: IssueCounts,
    #[serde(default)]
    pub report_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchStatusResponse {
    pub status: String,
    #[serde(default)]
    pub files: Vec<FileVerdict>,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub success_rate: Option<f64>,
}

#[async_trait]
pub trait QcApi: Send + Sync {
    /// Uploads a batch archive with its manifest.
    async fn submit_batch(
        &self,
        archive: &Path,
        manifest: &BatchManifest,
    ) -> Result<SubmitResponse, RemoteError>;

    async fn get_batch_status(&self, remote_batch_id: &str)
        -> Result<BatchStatusResponse, RemoteError>;

    /// Downloads a report to `dest`, returning the number of bytes written.
    async fn download_report(&self, url: &str, dest: &Path) -> Result<u64, RemoteError>;
}
