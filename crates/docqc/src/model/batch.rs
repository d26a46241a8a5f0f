//! Submission batches and their manifests.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{DocumentRole, QcRecord};
use super::status::BatchStatus;

/// One submission unit sent to the remote QC service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QcBatch {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_batch_id: Option<String>,
    pub status: BatchStatus,
    pub archive_path: PathBuf,
    pub archive_size: u64,
    pub file_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub processing_count: u32,
    pub manifest: BatchManifest,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QcBatch {
    /// Creates a PENDING batch for a freshly built archive.
    pub fn pending(id: String, archive_path: PathBuf, archive_size: u64, manifest: BatchManifest) -> Self {
        Self {
            id,
            remote_batch_id: None,
            status: BatchStatus::Pending,
            archive_path,
            archive_size,
            file_count: manifest.entries.len() as u32,
            completed_count: 0,
            failed_count: 0,
            processing_count: 0,
            manifest,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            last_polled_at: None,
            last_error: None,
        }
    }

    /// `completed + failed + processing ≤ file_count`.
    pub fn counters_consistent(&self) -> bool {
        self.completed_count + self.failed_count + self.processing_count <= self.file_count
    }

    /// Share of finished files that succeeded, if any finished.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed_count + self.failed_count;
        if finished == 0 {
            None
        } else {
            Some(self.completed_count as f64 / finished as f64)
        }
    }
}

/// Maps archive entries back to the records they were built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchManifest {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl BatchManifest {
    pub fn new(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Builds the manifest for the given records, in order.
    ///
    /// Entry names are prefixed with their position so that two documents
    /// with the same name in different chapters never collide in the archive.
    pub fn from_records(batch_id: &str, records: &[QcRecord]) -> Self {
        let mut manifest = Self::new(batch_id);
        for (index, record) in records.iter().enumerate() {
            manifest.entries.push(ManifestEntry {
                entry_name: entry_name(index, record),
                qc_id: record.id.clone(),
                original_name: record.original_name.clone(),
                source_path: record.source_path.clone(),
                folder_context: record.folder_context.clone(),
                role: record.role,
            });
        }
        manifest
    }

    pub fn entry_by_name(&self, entry_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.entry_name == entry_name)
    }

    pub fn entry_for_record(&self, qc_id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.qc_id == qc_id)
    }
}

fn entry_name(index: usize, record: &QcRecord) -> String {
    let stem = Path::new(&record.original_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| record.id.clone());
    let safe: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{:03}_{}.pdf", index + 1, safe)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// File name inside the archive.
    pub entry_name: String,
    pub qc_id: String,
    pub original_name: String,
    pub source_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_context: Option<String>,
    pub role: DocumentRole,
}
