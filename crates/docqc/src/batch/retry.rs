use tracing::{info, warn};

use crate::conversion::{ConversionJob, ConversionSubmitter};
use crate::error::StoreError;
use crate::model::{QcRecord, QcStatus};
use crate::store::QcStore;

/// The only path out of a terminal record state.
#[derive(Clone)]
pub struct RetryCoordinator {
    store: QcStore,
    submitter: ConversionSubmitter,
    max_retries: u32,
}

impl RetryCoordinator {
    pub fn new(store: QcStore, submitter: ConversionSubmitter, max_retries: u32) -> Self {
        Self {
            store,
            submitter,
            max_retries,
        }
    }

    /// Re-queues a CONVERSION_FAILED or NUMBERING_FAILED record for a fresh
    /// conversion.
    pub fn retry_record(&self, id: &str) -> Result<QcRecord, StoreError> {
        let record = self.store.retry_record(id, self.max_retries)?;
        self.enqueue(&record);
        Ok(record)
    }

    /// Detaches the failed files of a FAILED or PARTIAL_COMPLETE batch and
    /// sends each back through the pipeline on its own. Files whose rendition
    /// survived go straight back to assembly; the rest are reconverted.
    pub fn retry_batch(&self, batch_id: &str) -> Result<Vec<QcRecord>, StoreError> {
        let records = self.store.detach_failed_from_batch(batch_id)?;
        let mut reconverting = 0;
        for record in records.iter().filter(|r| r.status == QcStatus::Queued) {
            self.enqueue(record);
            reconverting += 1;
        }
        info!(
            batch_id = %batch_id,
            retried = records.len(),
            reconverting,
            "Batch retry scheduled"
        );
        Ok(records)
    }

    fn enqueue(&self, record: &QcRecord) {
        // A record left QUEUED is picked up again on the next start.
        if let Err(e) = self
            .submitter
            .submit(ConversionJob::new(&record.id, &record.source_path))
        {
            warn!(qc_id = %record.id, error = %e, "Could not enqueue retried record");
        }
    }
}
