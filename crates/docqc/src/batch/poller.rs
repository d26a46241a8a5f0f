use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{DocQcError, StoreError};
use crate::model::{QcBatch, QcRecord, QcStatus};
use crate::remote::{FileState, FileVerdict, QcApi};
use crate::store::QcStore;

/// Outcome of one poll pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub poll_errors: usize,
    pub records_updated: usize,
    pub settled: Vec<String>,
}

/// Asks the QC service about every submitted batch and applies the verdicts.
pub struct BatchPoller {
    store: QcStore,
    api: Arc<dyn QcApi>,
    reports_dir: PathBuf,
}

impl BatchPoller {
    pub fn new(store: QcStore, api: Arc<dyn QcApi>, reports_dir: PathBuf) -> Self {
        Self {
            store,
            api,
            reports_dir,
        }
    }

    pub async fn poll_once(&self) -> Result<PollSummary, DocQcError> {
        let mut summary = PollSummary::default();
        for batch in self.store.pollable_batches()? {
            let span = info_span!("poll", batch_id = %batch.id);
            let result = self
                .poll_batch(&batch, &mut summary)
                .instrument(span)
                .await;
            if let Err(e) = result {
                // The batch keeps its state and is polled again next pass.
                warn!(batch_id = %batch.id, error = %e, "Failed to apply batch status");
                summary.poll_errors += 1;
            }
        }
        if summary.polled > 0 {
            debug!(
                polled = summary.polled,
                updated = summary.records_updated,
                settled = summary.settled.len(),
                "Poll pass complete"
            );
        }
        Ok(summary)
    }

    async fn poll_batch(&self, batch: &QcBatch, summary: &mut PollSummary) -> Result<(), DocQcError> {
        let Some(remote_id) = batch.remote_batch_id.as_deref() else {
            warn!("Submitted batch has no remote id");
            return Ok(());
        };
        summary.polled += 1;

        let status = match self.api.get_batch_status(remote_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Batch status poll failed");
                summary.poll_errors += 1;
                self.store.record_batch_poll_error(&batch.id, &e.to_string())?;
                return Ok(());
            }
        };
        debug!(remote_status = %status.status, files = status.files.len(), "Batch status received");

        let members: HashMap<String, QcRecord> = self
            .store
            .get_batch_files(&batch.id)?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        for verdict in &status.files {
            let Some(entry) = batch.manifest.entry_by_name(&verdict.entry_name) else {
                warn!(entry = %verdict.entry_name, "Verdict for unknown archive entry");
                continue;
            };
            // Detached or deleted records no longer take verdicts.
            let Some(record) = members.get(&entry.qc_id) else {
                continue;
            };
            match self.apply_verdict(batch, record, verdict).await {
                Ok(true) => summary.records_updated += 1,
                Ok(false) => {}
                Err(StoreError::IllegalTransition { from, to, .. }) => {
                    warn!(qc_id = %record.id, %from, %to, "Ignoring verdict");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let batch = self.store.update_batch_progress(&batch.id)?;
        if batch.status.is_terminal() {
            summary.settled.push(batch.id);
        }
        Ok(())
    }

    /// Returns whether the record changed.
    async fn apply_verdict(
        &self,
        batch: &QcBatch,
        record: &QcRecord,
        verdict: &FileVerdict,
    ) -> Result<bool, StoreError> {
        match (verdict.state, record.status) {
            (FileState::Pending | FileState::Processing, _) => Ok(false),
            (FileState::Completed, QcStatus::Processing) => {
                let record = self.store.mark_downloading(&record.id, verdict.issues)?;
                self.finish_download(batch, &record, verdict).await?;
                Ok(true)
            }
            (FileState::Completed, QcStatus::Downloading) => {
                self.finish_download(batch, record, verdict).await
            }
            (FileState::Failed, QcStatus::Processing | QcStatus::Downloading) => {
                let error = verdict.error.as_deref().unwrap_or("QC job failed");
                self.store.mark_failed(&record.id, error)?;
                Ok(true)
            }
            (FileState::NumberingFailed, QcStatus::Processing) => {
                let reason = verdict
                    .error
                    .as_deref()
                    .unwrap_or("numbering check failed");
                self.store.mark_numbering_failed(&record.id, reason)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Downloads the report, if any, and completes the record. A failed
    /// download leaves the record DOWNLOADING for the next pass.
    async fn finish_download(
        &self,
        batch: &QcBatch,
        record: &QcRecord,
        verdict: &FileVerdict,
    ) -> Result<bool, StoreError> {
        let report_path = match verdict.report_url.as_deref() {
            Some(url) => {
                let dest = self
                    .reports_dir
                    .join(&batch.id)
                    .join(report_file_name(record, url));
                match self.api.download_report(url, &dest).await {
                    Ok(bytes) => {
                        debug!(qc_id = %record.id, bytes, "Report downloaded");
                        Some(dest)
                    }
                    Err(e) => {
                        warn!(qc_id = %record.id, error = %e, "Report download failed");
                        return Ok(false);
                    }
                }
            }
            None => None,
        };

        let record = self.store.mark_completed(&record.id, report_path)?;
        info!(
            qc_id = %record.id,
            critical = record.issues.critical,
            major = record.issues.major,
            minor = record.issues.minor,
            "QC completed"
        );
        Ok(true)
    }
}

/// `<record id>.<ext>`, taking the extension from the report URL path.
fn report_file_name(record: &QcRecord, url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or("");
    let ext = last
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("pdf");
    format!("{}.{}", record.id, ext.to_ascii_lowercase())
}
