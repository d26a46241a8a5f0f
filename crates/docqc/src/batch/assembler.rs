use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use super::archive::{archive_path, build_archive};
use crate::config::BatchConfig;
use crate::error::{BatchError, DocQcError};
use crate::model::{QcBatch, QcRecord};
use crate::remote::{QcApi, RemoteError};
use crate::store::QcStore;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Why a batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `batch_size` records were ready.
    Count,
    /// The size cap was reached with at least `min_batch_size` records.
    Size,
    /// The oldest ready record waited `batch_timeout_seconds`.
    Timeout,
}

/// A CONVERTED record as the planner sees it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub size: u64,
    pub converted_at: DateTime<Utc>,
}

impl Candidate {
    pub fn from_record(record: &QcRecord) -> Self {
        Self {
            id: record.id.clone(),
            size: record.rendition_size(),
            converted_at: record.converted_at.unwrap_or(record.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub record_ids: Vec<String>,
    pub total_bytes: u64,
    pub trigger: Trigger,
}

/// Decides whether the ready records form a batch now.
///
/// Candidates are taken oldest first up to `batch_size`, stopping before the
/// cumulative size would exceed the cap. A lone record larger than the cap
/// is still taken on its own.
pub fn plan_batch(
    candidates: &[Candidate],
    config: &BatchConfig,
    now: DateTime<Utc>,
) -> Option<BatchPlan> {
    let mut ordered: Vec<&Candidate> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.converted_at.cmp(&b.converted_at).then(a.id.cmp(&b.id)));
    let oldest = ordered.first()?.converted_at;

    let max_bytes = config.max_batch_bytes();
    let batch_size = config.batch_size.max(1);
    let mut record_ids = Vec::new();
    let mut total_bytes = 0u64;
    let mut size_cut = false;

    for candidate in ordered {
        if record_ids.len() >= batch_size {
            break;
        }
        let next = total_bytes.saturating_add(candidate.size);
        if !record_ids.is_empty() && next > max_bytes {
            size_cut = true;
            break;
        }
        record_ids.push(candidate.id.clone());
        total_bytes = next;
        if total_bytes >= max_bytes {
            size_cut = true;
            break;
        }
    }

    let waited = now.signed_duration_since(oldest).num_seconds();
    let trigger = if record_ids.len() >= batch_size {
        Trigger::Count
    } else if size_cut && record_ids.len() >= config.min_batch_size {
        Trigger::Size
    } else if waited >= config.batch_timeout_seconds as i64 {
        Trigger::Timeout
    } else {
        return None;
    };

    Some(BatchPlan {
        record_ids,
        total_bytes,
        trigger,
    })
}

/// Groups CONVERTED records into archives and submits them.
pub struct BatchAssembler {
    store: QcStore,
    api: Arc<dyn QcApi>,
    config: BatchConfig,
    archives_dir: PathBuf,
    retry_delay: Duration,
    lock: Mutex<()>,
}

impl BatchAssembler {
    pub fn new(
        store: QcStore,
        api: Arc<dyn QcApi>,
        config: BatchConfig,
        archives_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            api,
            config,
            archives_dir,
            retry_delay: DEFAULT_RETRY_DELAY,
            lock: Mutex::new(()),
        }
    }

    /// Base delay of the linear back-off between submission attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Cuts batches until the planner says wait. Returns the submitted ones.
    pub async fn assemble_ready(&self) -> Result<Vec<QcBatch>, DocQcError> {
        let mut submitted = Vec::new();
        while let Some(batch) = self.assemble_once().await? {
            submitted.push(batch);
        }
        Ok(submitted)
    }

    /// Runs one trigger check and, if it fires, builds and submits one
    /// batch.
    ///
    /// Passes are serialized; records claimed by one pass are never seen by
    /// another. A batch the service does not accept is discarded and its
    /// records return to CONVERTED.
    pub async fn assemble_once(&self) -> Result<Option<QcBatch>, DocQcError> {
        let _guard = self.lock.lock().await;

        let records = self.usable_candidates()?;
        let candidates: Vec<Candidate> = records.iter().map(Candidate::from_record).collect();
        let Some(plan) = plan_batch(&candidates, &self.config, Utc::now()) else {
            debug!(ready = candidates.len(), "No batch due");
            return Ok(None);
        };

        let batch_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("assembly", batch_id = %batch_id, trigger = ?plan.trigger);
        self.assemble_plan(&batch_id, plan).instrument(span).await
    }

    async fn assemble_plan(
        &self,
        batch_id: &str,
        plan: BatchPlan,
    ) -> Result<Option<QcBatch>, DocQcError> {
        let archive = archive_path(&self.archives_dir, batch_id);
        let Some((batch, members)) = self.store.create_batch(batch_id, &plan.record_ids, &archive)?
        else {
            return Ok(None);
        };

        let size = match self.build(&batch, members).await {
            Ok(size) => size,
            Err(e) => {
                self.abandon(&batch, &e.to_string());
                return Err(e.into());
            }
        };
        self.store.set_batch_archive_size(&batch.id, size)?;
        info!(
            files = batch.file_count,
            bytes = size,
            trigger = ?plan.trigger,
            "Batch archive built"
        );

        match self.submit(&archive, &batch).await {
            Ok(response) => {
                let jobs: HashMap<String, String> = response
                    .jobs
                    .into_iter()
                    .map(|job| (job.entry_name, job.job_id))
                    .collect();
                let batch = self
                    .store
                    .mark_batch_submitted(&batch.id, &response.batch_id, &jobs)?;
                Ok(Some(batch))
            }
            Err(e) => {
                self.abandon(&batch, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// CONVERTED records whose rendition is usable. A record whose rendition
    /// disappeared is marked CONVERSION_FAILED so a retry reconverts it.
    fn usable_candidates(&self) -> Result<Vec<QcRecord>, DocQcError> {
        let mut usable = Vec::new();
        for record in self.store.eligible_for_batching()? {
            let present = record.rendition_path.as_deref().is_some_and(Path::exists);
            if present {
                usable.push(record);
            } else {
                warn!(qc_id = %record.id, "Rendition missing, record cannot be batched");
                self.store.mark_rendition_lost(&record.id)?;
            }
        }
        Ok(usable)
    }

    async fn build(&self, batch: &QcBatch, members: Vec<QcRecord>) -> Result<u64, BatchError> {
        let dest = batch.archive_path.clone();
        let manifest = batch.manifest.clone();
        tokio::task::spawn_blocking(move || build_archive(&dest, &manifest, &members))
            .await
            .map_err(|e| BatchError::Archive {
                path: batch.archive_path.clone(),
                reason: e.to_string(),
            })?
    }

    async fn submit(
        &self,
        archive: &Path,
        batch: &QcBatch,
    ) -> Result<crate::remote::SubmitResponse, RemoteError> {
        let attempts = self.config.submit_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.api.submit_batch(archive, &batch.manifest).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_permanent() || attempt >= attempts => {
                    warn!(attempt, error = %e, "Batch submission failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Batch submission failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    fn abandon(&self, batch: &QcBatch, reason: &str) {
        if let Err(e) = self.store.discard_batch(&batch.id, reason) {
            warn!(batch_id = %batch.id, error = %e, "Failed to discard batch");
        }
        if batch.archive_path.exists() {
            if let Err(e) = std::fs::remove_file(&batch.archive_path) {
                warn!(batch_id = %batch.id, error = %e, "Failed to remove archive");
            }
        }
        self.store
            .events()
            .error(format!("Batch submission failed: {}", reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::testing::write_pdf;
    use crate::db::Database;
    use crate::events::{EventBroadcaster, PipelineEvent};
    use crate::model::{BatchStatus, QcStatus};
    use crate::remote::testing::FakeQcApi;
    use chrono::Duration as ChronoDuration;

    fn candidate(id: &str, size: u64, age_secs: i64) -> Candidate {
        Candidate {
            id: id.to_string(),
            size,
            converted_at: Utc::now() - ChronoDuration::seconds(age_secs),
        }
    }

    fn config() -> BatchConfig {
        BatchConfig {
            batch_size: 3,
            min_batch_size: 2,
            max_batch_size_mb: 1,
            batch_timeout_seconds: 60,
            ..Default::default()
        }
    }

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_waits_below_thresholds() {
        let plan = plan_batch(&[candidate("a", 10, 5)], &config(), Utc::now());
        assert!(plan.is_none());
        assert!(plan_batch(&[], &config(), Utc::now()).is_none());
    }

    #[test]
    fn test_plan_count_trigger_takes_oldest() {
        let candidates = vec![
            candidate("new", 10, 1),
            candidate("old", 10, 30),
            candidate("mid", 10, 20),
            candidate("mid2", 10, 10),
        ];
        let plan = plan_batch(&candidates, &config(), Utc::now()).unwrap();
        assert_eq!(plan.trigger, Trigger::Count);
        assert_eq!(plan.record_ids, vec!["old", "mid", "mid2"]);
    }

    #[test]
    fn test_plan_size_trigger() {
        let candidates = vec![candidate("a", MB / 2, 3), candidate("b", MB / 3, 2), candidate("c", MB / 2, 1)];
        let plan = plan_batch(&candidates, &config(), Utc::now()).unwrap();
        assert_eq!(plan.trigger, Trigger::Size);
        assert_eq!(plan.record_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_plan_size_cut_below_minimum_waits() {
        let candidates = vec![candidate("a", MB - 10, 3), candidate("b", MB / 2, 2)];
        assert!(plan_batch(&candidates, &config(), Utc::now()).is_none());
    }

    #[test]
    fn test_plan_oversized_record_goes_alone_on_timeout() {
        let candidates = vec![candidate("huge", 5 * MB, 120), candidate("b", 10, 1)];
        let plan = plan_batch(&candidates, &config(), Utc::now()).unwrap();
        assert_eq!(plan.trigger, Trigger::Timeout);
        assert_eq!(plan.record_ids, vec!["huge"]);
    }

    #[test]
    fn test_plan_timeout_trigger() {
        let plan = plan_batch(&[candidate("a", 10, 61)], &config(), Utc::now()).unwrap();
        assert_eq!(plan.trigger, Trigger::Timeout);
        assert_eq!(plan.record_ids.len(), 1);
    }

    struct Setup {
        dir: tempfile::TempDir,
        store: QcStore,
        api: Arc<FakeQcApi>,
        assembler: BatchAssembler,
    }

    fn setup(config: BatchConfig) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let store = QcStore::new(Database::open_in_memory().unwrap(), EventBroadcaster::new(256));
        let api = Arc::new(FakeQcApi::new());
        let assembler = BatchAssembler::new(
            store.clone(),
            api.clone(),
            config,
            dir.path().join("batches"),
        )
        .with_retry_delay(Duration::from_millis(1));
        Setup {
            dir,
            store,
            api,
            assembler,
        }
    }

    fn converted(s: &Setup, name: &str) -> QcRecord {
        let source = s.dir.path().join(name);
        std::fs::write(&source, b"docx").unwrap();
        let record = s
            .store
            .create_record(QcRecord::new(source, format!("sig-{}", name), Some(s.dir.path())))
            .unwrap()
            .unwrap();
        let rendition = s.dir.path().join("renditions").join(format!("{}.pdf", record.id));
        write_pdf(&rendition, 1);
        s.store.mark_converting(&record.id).unwrap();
        s.store.mark_converted(&record.id, &rendition, "fake#1").unwrap()
    }

    #[tokio::test]
    async fn test_assemble_submits_batch() {
        let s = setup(config());
        let records: Vec<_> = ["q1.docx", "q2.docx", "q3.docx"]
            .iter()
            .map(|n| converted(&s, n))
            .collect();

        let batch = s.assembler.assemble_once().await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Submitted);
        assert_eq!(batch.remote_batch_id.as_deref(), Some("remote-1"));
        assert_eq!(batch.file_count, 3);
        assert_eq!(batch.processing_count, 3);
        assert!(batch.archive_path.exists());
        assert!(s.store.get_batch(&batch.id).unwrap().archive_size > 0);

        for record in &records {
            let record = s.store.get_record(&record.id).unwrap();
            assert_eq!(record.status, QcStatus::Processing);
            assert_eq!(record.batch_id.as_deref(), Some(batch.id.as_str()));
            assert!(record.external_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_repeated_and_concurrent_checks_do_not_duplicate() {
        let s = setup(config());
        for name in ["q1.docx", "q2.docx", "q3.docx"] {
            converted(&s, name);
        }

        let (a, b) = tokio::join!(s.assembler.assemble_once(), s.assembler.assemble_once());
        let created = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(created, 1);
        assert!(s.assembler.assemble_once().await.unwrap().is_none());
        assert_eq!(s.api.submission_count(), 1);
        assert_eq!(s.store.get_batches(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_submit_failure_is_retried() {
        let s = setup(config());
        for name in ["q1.docx", "q2.docx", "q3.docx"] {
            converted(&s, name);
        }
        s.api.fail_submissions(2);

        let batch = s.assembler.assemble_once().await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Submitted);
        assert_eq!(s.api.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_reverted() {
        let s = setup(config());
        let records: Vec<_> = ["q1.docx", "q2.docx", "q3.docx"]
            .iter()
            .map(|n| converted(&s, n))
            .collect();
        s.api.fail_submissions(3);
        let mut rx = s.store.events().subscribe();

        let result = s.assembler.assemble_once().await;
        assert!(matches!(result, Err(DocQcError::Remote(_))));

        assert!(s.store.get_batches(None).unwrap().is_empty());
        for record in &records {
            let record = s.store.get_record(&record.id).unwrap();
            assert_eq!(record.status, QcStatus::Converted);
            assert!(record.batch_id.is_none());
        }
        let archives: Vec<_> = std::fs::read_dir(s.dir.path().join("batches"))
            .unwrap()
            .collect();
        assert!(archives.is_empty());

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            saw_error |= matches!(event, PipelineEvent::Error { .. });
        }
        assert!(saw_error);

        // The records are eligible again on the next pass.
        let batch = s.assembler.assemble_once().await.unwrap().unwrap();
        assert_eq!(batch.file_count, 3);
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        let s = setup(config());
        for name in ["q1.docx", "q2.docx", "q3.docx"] {
            converted(&s, name);
        }
        s.api.reject_submissions();

        assert!(s.assembler.assemble_once().await.is_err());
        assert_eq!(s.api.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_rendition_fails_conversion_not_batch() {
        let s = setup(config());
        let gone = converted(&s, "gone.docx");
        std::fs::remove_file(gone.rendition_path.as_ref().unwrap()).unwrap();
        for name in ["q1.docx", "q2.docx", "q3.docx"] {
            converted(&s, name);
        }

        let batch = s.assembler.assemble_once().await.unwrap().unwrap();
        assert!(batch.manifest.entry_for_record(&gone.id).is_none());
        let gone = s.store.get_record(&gone.id).unwrap();
        assert_eq!(gone.status, QcStatus::ConversionFailed);
        assert!(gone.rendition_path.is_none());
        assert!(gone
            .error_message
            .unwrap()
            .starts_with("rendition missing before batching"));
    }

    #[tokio::test]
    async fn test_assemble_ready_drains_full_batches() {
        let s = setup(config());
        for i in 0..7 {
            converted(&s, &format!("q{}.docx", i));
        }

        let batches = s.assembler.assemble_ready().await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(s.store.eligible_for_batching().unwrap().len(), 1);
    }
}
