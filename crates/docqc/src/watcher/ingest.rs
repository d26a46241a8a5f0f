use std::path::Path;

use tracing::{debug, info, warn};

use crate::conversion::{ConversionJob, ConversionSubmitter};
use crate::error::{DocQcError, WatchError};
use crate::events::PipelineEvent;
use crate::model::{file_signature, QcRecord};
use crate::sanitize::redact_path;
use crate::store::QcStore;

#[derive(Debug)]
pub enum IngestOutcome {
    /// A new QUEUED record was created and its conversion scheduled.
    Created(QcRecord),
    /// The path is already tracked, by this version or by an earlier one
    /// still in progress.
    AlreadyKnown(String),
}

/// Turns a detected document into a QC record and a conversion job.
#[derive(Clone)]
pub struct Ingestor {
    store: QcStore,
    submitter: ConversionSubmitter,
}

impl Ingestor {
    pub fn new(store: QcStore, submitter: ConversionSubmitter) -> Self {
        Self { store, submitter }
    }

    pub fn ingest(&self, path: &Path, watch_root: &Path) -> Result<IngestOutcome, DocQcError> {
        let signature = file_signature(path).map_err(|e| WatchError::Inaccessible {
            path: path.to_path_buf(),
            source: e,
        })?;

        let record = QcRecord::new(path.to_path_buf(), signature.clone(), Some(watch_root));
        let Some(record) = self.store.create_record(record)? else {
            debug!(file = %redact_path(path), "Document already recorded");
            let existing = self
                .store
                .latest_for_source(path)?
                .map(|r| r.id)
                .unwrap_or_default();
            return Ok(IngestOutcome::AlreadyKnown(existing));
        };

        info!(
            qc_id = %record.id,
            file = %redact_path(path),
            role = %record.role,
            "New document detected"
        );
        self.store.events().send(PipelineEvent::file_detected(
            &record.id,
            &record.source_path.to_string_lossy(),
        ));

        // A record that cannot be enqueued now stays QUEUED and is picked up
        // again on the next start.
        if let Err(e) = self
            .submitter
            .submit(ConversionJob::new(&record.id, &record.source_path))
        {
            warn!(qc_id = %record.id, error = %e, "Could not enqueue conversion");
        }

        Ok(IngestOutcome::Created(record))
    }
}
