//! Per-document QC record.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::status::QcStatus;

static RE_SOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(solution|l(ö|oe)sung|answer|answer[-_ ]?key|\bkey\b|_sol\b|-sol\b)").unwrap()
});
static RE_THEORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(theory|theorie|question|aufgabe|exercise)").unwrap());

/// Detected role of a document within its chapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentRole {
    Theory,
    Solution,
    Unknown,
}

impl DocumentRole {
    /// Detects the role from the file name, falling back to the folder context.
    pub fn detect(file_name: &str, folder_context: Option<&str>) -> Self {
        if RE_SOLUTION.is_match(file_name) {
            return DocumentRole::Solution;
        }
        if RE_THEORY.is_match(file_name) {
            return DocumentRole::Theory;
        }
        match folder_context {
            Some(folder) if RE_SOLUTION.is_match(folder) => DocumentRole::Solution,
            Some(folder) if RE_THEORY.is_match(folder) => DocumentRole::Theory,
            _ => DocumentRole::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentRole::Theory => "theory",
            DocumentRole::Solution => "solution",
            DocumentRole::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "theory" => Ok(DocumentRole::Theory),
            "solution" => Ok(DocumentRole::Solution),
            "unknown" => Ok(DocumentRole::Unknown),
            other => Err(format!("unknown document role '{}'", other)),
        }
    }
}

/// Issue counts reported by the remote QC service, by severity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueCounts {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
}

impl IssueCounts {
    pub fn total(&self) -> u32 {
        self.critical + self.major + self.minor
    }
}

/// One QC record per source document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QcRecord {
    pub id: String,
    pub source_path: PathBuf,
    pub original_name: String,
    /// `<mtime-secs>-<len>` of the source when it was detected.
    pub file_signature: String,
    pub status: QcStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendition_path: Option<PathBuf>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_context: Option<String>,
    pub role: DocumentRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_batch_id: Option<String>,
    pub issues: IssueCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub converted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QcRecord {
    /// Creates a fresh QUEUED record for a detected document.
    pub fn new(
        source_path: PathBuf,
        file_signature: String,
        watch_root: Option<&Path>,
    ) -> Self {
        let now = Utc::now();
        let original_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let folder_context = watch_root.and_then(|root| folder_context(&source_path, root));
        let role = DocumentRole::detect(&original_name, folder_context.as_deref());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_path,
            original_name,
            file_signature,
            status: QcStatus::Queued,
            rendition_path: None,
            retry_count: 0,
            error_message: None,
            processed_by: None,
            watch_root: watch_root.map(Path::to_path_buf),
            folder_context,
            role,
            batch_id: None,
            original_batch_id: None,
            issues: IssueCounts::default(),
            report_path: None,
            external_id: None,
            created_at: now,
            updated_at: now,
            conversion_started_at: None,
            converted_at: None,
            submitted_at: None,
            completed_at: None,
        }
    }

    /// Size of the rendition on disk, or 0 if it is missing.
    pub fn rendition_size(&self) -> u64 {
        self.rendition_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Parent directory of `source` relative to `root`, using `/` separators.
///
/// Documents directly in the root have no folder context.
pub fn folder_context(source: &Path, root: &Path) -> Option<String> {
    let parent = source.parent()?;
    let relative = parent.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Modification signature used to detect re-ingestion of an unchanged file.
pub fn file_signature(path: &Path) -> std::io::Result<String> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(format!("{}-{}", mtime, metadata.len()))
}
