//! In-memory QC service for unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    BatchStatusResponse, FileState, FileVerdict, JobAssignment, QcApi, RemoteError,
    SubmitResponse,
};
use crate::model::{BatchManifest, IssueCounts};

#[derive(Default)]
pub struct FakeQcApi {
    pub submissions: Mutex<Vec<BatchManifest>>,
    submit_failures: AtomicU32,
    reject_permanently: AtomicBool,
    fail_downloads: AtomicBool,
    statuses: Mutex<HashMap<String, BatchStatusResponse>>,
}

impl FakeQcApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` submissions fail with a 503.
    pub fn fail_submissions(&self, n: u32) {
        self.submit_failures.store(n, Ordering::SeqCst);
    }

    /// Every submission fails with a 400.
    pub fn reject_submissions(&self) {
        self.reject_permanently.store(true, Ordering::SeqCst);
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    /// Sets the same state for every entry of the `index`-th submission.
    pub fn settle_all(&self, index: usize, state: FileState) {
        let manifest = self.submissions.lock().unwrap()[index].clone();
        let verdicts = manifest
            .entries
            .iter()
            .map(|entry| verdict(&entry.entry_name, state))
            .collect();
        self.set_verdicts(&remote_id(index), verdicts);
    }

    pub fn set_verdicts(&self, remote_batch_id: &str, files: Vec<FileVerdict>) {
        let completed = files
            .iter()
            .filter(|f| f.state == FileState::Completed)
            .count() as u32;
        let failed = files
            .iter()
            .filter(|f| matches!(f.state, FileState::Failed | FileState::NumberingFailed))
            .count() as u32;
        self.statuses.lock().unwrap().insert(
            remote_batch_id.to_string(),
            BatchStatusResponse {
                status: "processing".to_string(),
                files,
                completed,
                failed,
                success_rate: None,
            },
        );
    }
}

pub fn remote_id(index: usize) -> String {
    format!("remote-{}", index + 1)
}

pub fn verdict(entry_name: &str, state: FileState) -> FileVerdict {
    FileVerdict {
        entry_name: entry_name.to_string(),
        job_id: Some(format!("job-{}", entry_name)),
        state,
        issues: if state == FileState::Completed {
            IssueCounts {
                critical: 0,
                major: 1,
                minor: 2,
            }
        } else {
            IssueCounts::default()
        },
        report_url: (state == FileState::Completed)
            .then(|| format!("https://qc.test/reports/{}", entry_name)),
        error: (state == FileState::Failed).then(|| "remote job failed".to_string()),
    }
}

#[async_trait]
impl QcApi for FakeQcApi {
    async fn submit_batch(
        &self,
        _archive: &Path,
        manifest: &BatchManifest,
    ) -> Result<SubmitResponse, RemoteError> {
        if self.reject_permanently.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                code: 400,
                body: "bad archive".to_string(),
            });
        }
        let remaining = self.submit_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.submit_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Status {
                code: 503,
                body: "unavailable".to_string(),
            });
        }

        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(manifest.clone());
        Ok(SubmitResponse {
            batch_id: remote_id(submissions.len() - 1),
            jobs: manifest
                .entries
                .iter()
                .map(|entry| JobAssignment {
                    entry_name: entry.entry_name.clone(),
                    job_id: format!("job-{}", entry.entry_name),
                })
                .collect(),
        })
    }

    async fn get_batch_status(
        &self,
        remote_batch_id: &str,
    ) -> Result<BatchStatusResponse, RemoteError> {
        if let Some(status) = self.statuses.lock().unwrap().get(remote_batch_id) {
            return Ok(status.clone());
        }
        let known = self
            .submissions
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .any(|(i, _)| remote_id(i) == remote_batch_id);
        if known {
            Ok(BatchStatusResponse {
                status: "pending".to_string(),
                files: Vec::new(),
                completed: 0,
                failed: 0,
                success_rate: None,
            })
        } else {
            Err(RemoteError::Status {
                code: 404,
                body: "unknown batch".to_string(),
            })
        }
    }

    async fn download_report(&self, _url: &str, dest: &Path) -> Result<u64, RemoteError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                code: 500,
                body: "report unavailable".to_string(),
            });
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RemoteError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(dest, b"report").map_err(|e| RemoteError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
        Ok(6)
    }
}
