//! QC record store.
//!
//! The single source of truth for per-file and per-batch state. Every status
//! change runs through [`QcStore::transition`] (or one of the multi-row
//! operations below), which checks the transition table, writes the record,
//! and recomputes the owning batch's counters in the same locked transaction.
//! Events are published only after the transaction committed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::record_repo::RecordFilter;
use crate::db::stats_repo::QcStats;
use crate::db::{batch_repo, record_repo, stats_repo, Database, DatabaseError};
use crate::error::StoreError;
use crate::events::{EventBroadcaster, PipelineEvent};
use crate::model::{
    BatchManifest, BatchStatus, IssueCounts, QcBatch, QcRecord, QcStatus, TransitionKind,
};

/// One page of records plus the total matching the filter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<QcRecord>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
}

/// What [`QcStore::recover_interrupted`] cleaned up after an unclean stop.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records that were mid-conversion and are now CONVERSION_FAILED.
    pub interrupted_conversions: Vec<String>,
    /// Records returned from SUBMITTING to CONVERTED.
    pub reverted_records: Vec<String>,
    /// PENDING batches that were never accepted and have been removed.
    pub discarded_batches: Vec<QcBatch>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted_conversions.is_empty()
            && self.reverted_records.is_empty()
            && self.discarded_batches.is_empty()
    }
}

#[derive(Clone)]
pub struct QcStore {
    db: Database,
    events: EventBroadcaster,
}

impl QcStore {
    pub fn new(db: Database, events: EventBroadcaster) -> Self {
        Self { db, events }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Persists a new QUEUED record.
    ///
    /// Returns `None` if the source path is already tracked: either this
    /// signature was recorded before, or an earlier version of the file is
    /// still moving through the pipeline. A changed file only gets a new
    /// record once its previous record is terminal.
    pub fn create_record(&self, record: QcRecord) -> Result<Option<QcRecord>, StoreError> {
        let inserted = self.db.with_transaction(|conn| {
            if let Some(latest) = record_repo::latest_by_source_path(conn, &record.source_path)? {
                if latest.file_signature == record.file_signature || !latest.status.is_terminal() {
                    return Ok::<_, StoreError>(false);
                }
            }
            Ok(record_repo::insert_if_absent(conn, &record)?)
        })?;
        Ok(inserted.then_some(record))
    }

    /// Newest record for `source_path`, whatever its signature.
    pub fn latest_for_source(&self, source_path: &Path) -> Result<Option<QcRecord>, StoreError> {
        Ok(self
            .db
            .with_conn(|c| record_repo::latest_by_source_path(c, source_path))?)
    }

    pub fn get_record(&self, id: &str) -> Result<QcRecord, StoreError> {
        self.db
            .with_conn(|c| record_repo::find_by_id(c, id))?
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))
    }

    pub fn get_records(
        &self,
        filter: &RecordFilter,
        limit: u64,
        offset: u64,
    ) -> Result<RecordPage, StoreError> {
        let (records, total) = self
            .db
            .with_conn(|c| record_repo::query(c, filter, limit, offset))?;
        Ok(RecordPage {
            records,
            total,
            limit,
            offset,
        })
    }

    /// Records waiting for conversion, oldest first.
    pub fn queued_records(&self) -> Result<Vec<QcRecord>, StoreError> {
        Ok(self
            .db
            .with_conn(|c| record_repo::list_by_status(c, QcStatus::Queued))?)
    }

    /// CONVERTED records not yet claimed by any batch.
    pub fn eligible_for_batching(&self) -> Result<Vec<QcRecord>, StoreError> {
        Ok(self.db.with_conn(record_repo::eligible_for_batching)?)
    }

    pub fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        let deleted = self.db.with_transaction(|conn| {
            let Some(record) = record_repo::find_by_id(conn, id)? else {
                return Ok(false);
            };
            record_repo::delete(conn, id)?;
            if let Some(batch_id) = record.batch_id.as_deref() {
                refresh_counters(conn, batch_id, 1)?;
            }
            Ok::<_, StoreError>(true)
        })?;
        if !deleted {
            return Err(StoreError::RecordNotFound(id.to_string()));
        }
        info!(qc_id = %id, "Deleted QC record");
        Ok(())
    }

    /// Purges every record. Batch rows are history and stay.
    pub fn delete_all_records(&self) -> Result<u64, StoreError> {
        let deleted = self.db.with_transaction(|conn| {
            let deleted = record_repo::delete_all(conn)?;
            conn.execute(
                "UPDATE qc_batches SET completed_count = 0, failed_count = 0, processing_count = 0",
                [],
            )?;
            Ok::<_, StoreError>(deleted)
        })?;
        info!(count = deleted, "Deleted all QC records");
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<QcStats, StoreError> {
        Ok(self.db.with_conn(stats_repo::snapshot)?)
    }

    /// Moves a record along one edge of the transition table.
    ///
    /// `mutate` runs after the status was set and may fill in the fields that
    /// belong to the new state. The owning batch's counters are recomputed in
    /// the same transaction.
    pub fn transition<F>(
        &self,
        id: &str,
        to: QcStatus,
        kind: TransitionKind,
        mutate: F,
    ) -> Result<QcRecord, StoreError>
    where
        F: FnOnce(&mut QcRecord),
    {
        let (record, batch) = self.db.with_transaction(|conn| {
            let mut record = record_repo::find_by_id(conn, id)?
                .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
            check_edge(&record, to, kind)?;

            record.status = to;
            record.updated_at = Utc::now();
            mutate(&mut record);
            record_repo::update(conn, &record)?;

            let batch = match record.batch_id.as_deref() {
                Some(batch_id) => refresh_counters(conn, batch_id, 0)?,
                None => None,
            };
            Ok::<_, StoreError>((record, batch))
        })?;

        debug!(qc_id = %record.id, status = %record.status, "Record transitioned");
        self.emit_record(&record);
        if let Some(batch) = batch {
            self.emit_batch(&batch);
        }
        Ok(record)
    }

    pub fn mark_converting(&self, id: &str) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::Converting, TransitionKind::Forward, |r| {
            r.conversion_started_at = Some(Utc::now());
            r.error_message = None;
        })
    }

    pub fn mark_converted(
        &self,
        id: &str,
        rendition_path: &Path,
        processed_by: &str,
    ) -> Result<QcRecord, StoreError> {
        let rendition_path = rendition_path.to_path_buf();
        self.transition(id, QcStatus::Converted, TransitionKind::Forward, |r| {
            r.rendition_path = Some(rendition_path);
            r.processed_by = Some(processed_by.to_string());
            r.converted_at = Some(Utc::now());
            r.error_message = None;
        })
    }

    pub fn mark_conversion_failed(
        &self,
        id: &str,
        error: &str,
        processed_by: Option<&str>,
    ) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::ConversionFailed, TransitionKind::Forward, |r| {
            r.error_message = Some(error.to_string());
            if let Some(engine) = processed_by {
                r.processed_by = Some(engine.to_string());
            }
            r.completed_at = Some(Utc::now());
        })
    }

    /// Fails a CONVERTED record whose rendition is gone. A retry sends it
    /// back through conversion.
    pub fn mark_rendition_lost(&self, id: &str) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::ConversionFailed, TransitionKind::Forward, |r| {
            r.error_message = Some(format!(
                "rendition missing before batching: {}",
                r.rendition_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ));
            r.rendition_path = None;
            r.completed_at = Some(Utc::now());
        })
    }

    pub fn mark_numbering_failed(&self, id: &str, reason: &str) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::NumberingFailed, TransitionKind::Forward, |r| {
            r.error_message = Some(reason.to_string());
            r.completed_at = Some(Utc::now());
        })
    }

    pub fn mark_downloading(&self, id: &str, issues: IssueCounts) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::Downloading, TransitionKind::Forward, |r| {
            r.issues = issues;
        })
    }

    pub fn mark_completed(
        &self,
        id: &str,
        report_path: Option<PathBuf>,
    ) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::Completed, TransitionKind::Forward, |r| {
            r.report_path = report_path;
            r.error_message = None;
            r.completed_at = Some(Utc::now());
        })
    }

    pub fn mark_failed(&self, id: &str, error: &str) -> Result<QcRecord, StoreError> {
        self.transition(id, QcStatus::Failed, TransitionKind::Forward, |r| {
            r.error_message = Some(error.to_string());
            r.completed_at = Some(Utc::now());
        })
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn get_batch(&self, id: &str) -> Result<QcBatch, StoreError> {
        self.db
            .with_conn(|c| batch_repo::find_by_id(c, id))?
            .ok_or_else(|| StoreError::BatchNotFound(id.to_string()))
    }

    pub fn get_batches(&self, status: Option<BatchStatus>) -> Result<Vec<QcBatch>, StoreError> {
        Ok(self.db.with_conn(|c| batch_repo::list(c, status))?)
    }

    /// Current members of a batch.
    pub fn get_batch_files(&self, batch_id: &str) -> Result<Vec<QcRecord>, StoreError> {
        self.get_batch(batch_id)?;
        Ok(self
            .db
            .with_conn(|c| record_repo::list_by_batch(c, batch_id))?)
    }

    pub fn pollable_batches(&self) -> Result<Vec<QcBatch>, StoreError> {
        Ok(self.db.with_conn(batch_repo::list_pollable)?)
    }

    /// Claims the candidates that are still CONVERTED and unbatched, moves
    /// them to SUBMITTING under `batch_id` and inserts a PENDING batch.
    ///
    /// Candidates claimed by an earlier pass are skipped. Returns `None` if
    /// nothing could be claimed.
    pub fn create_batch(
        &self,
        batch_id: &str,
        candidate_ids: &[String],
        archive_path: &Path,
    ) -> Result<Option<(QcBatch, Vec<QcRecord>)>, StoreError> {
        let claimed = self.db.with_transaction(|conn| {
            let now = Utc::now();
            let mut members = Vec::with_capacity(candidate_ids.len());
            for id in candidate_ids {
                let Some(mut record) = record_repo::find_by_id(conn, id)? else {
                    continue;
                };
                if record.status != QcStatus::Converted || record.batch_id.is_some() {
                    continue;
                }
                record.status = QcStatus::Submitting;
                record.batch_id = Some(batch_id.to_string());
                record.updated_at = now;
                record_repo::update(conn, &record)?;
                members.push(record);
            }
            if members.is_empty() {
                return Ok::<_, StoreError>(None);
            }

            let manifest = BatchManifest::from_records(batch_id, &members);
            let mut batch =
                QcBatch::pending(batch_id.to_string(), archive_path.to_path_buf(), 0, manifest);
            batch.processing_count = members.len() as u32;
            batch_repo::insert(conn, &batch)?;
            Ok(Some((batch, members)))
        })?;

        if let Some((batch, members)) = &claimed {
            info!(batch_id = %batch.id, files = members.len(), "Batch created");
            for record in members {
                self.emit_record(record);
            }
            self.emit_batch(batch);
        }
        Ok(claimed)
    }

    pub fn set_batch_archive_size(&self, batch_id: &str, size: u64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE qc_batches SET archive_size = ?2 WHERE id = ?1",
                params![batch_id, size],
            )?;
            if changed == 0 {
                return Err(StoreError::BatchNotFound(batch_id.to_string()));
            }
            Ok(())
        })
    }

    /// Records the remote acceptance of a PENDING batch: the batch becomes
    /// SUBMITTED and its SUBMITTING members become PROCESSING.
    ///
    /// `jobs` maps archive entry names to remote job ids.
    pub fn mark_batch_submitted(
        &self,
        batch_id: &str,
        remote_batch_id: &str,
        jobs: &HashMap<String, String>,
    ) -> Result<QcBatch, StoreError> {
        let (batch, members) = self.db.with_transaction(|conn| {
            let mut batch = batch_repo::find_by_id(conn, batch_id)?
                .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
            if !batch.status.can_transition(BatchStatus::Submitted) {
                return Err(StoreError::IllegalBatchTransition {
                    id: batch_id.to_string(),
                    from: batch.status,
                    to: BatchStatus::Submitted,
                });
            }

            let now = Utc::now();
            let mut members = Vec::new();
            for mut record in record_repo::list_by_batch(conn, batch_id)? {
                if record.status != QcStatus::Submitting {
                    continue;
                }
                check_edge(&record, QcStatus::Processing, TransitionKind::Forward)?;
                record.status = QcStatus::Processing;
                record.external_id = batch
                    .manifest
                    .entry_for_record(&record.id)
                    .and_then(|entry| jobs.get(&entry.entry_name))
                    .cloned();
                record.submitted_at = Some(now);
                record.updated_at = now;
                record_repo::update(conn, &record)?;
                members.push(record);
            }

            batch.status = BatchStatus::Submitted;
            batch.remote_batch_id = Some(remote_batch_id.to_string());
            batch.submitted_at = Some(now);
            batch.last_error = None;
            batch_repo::update(conn, &batch)?;
            let batch = refresh_counters(conn, batch_id, 0)?
                .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
            Ok((batch, members))
        })?;

        info!(batch_id = %batch.id, remote_batch_id = %remote_batch_id, "Batch submitted");
        for record in &members {
            self.emit_record(record);
        }
        self.emit_batch(&batch);
        Ok(batch)
    }

    /// Drops a PENDING batch the remote service never accepted. Its members
    /// go back to CONVERTED without a batch so they re-enter assembly.
    pub fn discard_batch(&self, batch_id: &str, reason: &str) -> Result<Vec<QcRecord>, StoreError> {
        let reverted = self
            .db
            .with_transaction(|conn| revert_pending_batch(conn, batch_id, Some(reason)))?;
        warn!(batch_id = %batch_id, files = reverted.len(), reason = %reason, "Batch discarded");
        for record in &reverted {
            self.emit_record(record);
        }
        Ok(reverted)
    }

    /// Applies the outcome of one poll: recomputes counters, moves the batch
    /// SUBMITTED -> PROCESSING and settles it once no member is in flight.
    pub fn update_batch_progress(&self, batch_id: &str) -> Result<QcBatch, StoreError> {
        let batch = self.db.with_transaction(|conn| {
            let mut batch = refresh_counters(conn, batch_id, 0)?
                .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
            let now = Utc::now();
            batch.last_polled_at = Some(now);
            batch.last_error = None;

            if batch.status == BatchStatus::Submitted {
                batch.status = BatchStatus::Processing;
            }
            if batch.status == BatchStatus::Processing && batch.processing_count == 0 {
                batch.status = settled_status(&batch);
                batch.completed_at = Some(now);
            }
            batch_repo::update(conn, &batch)?;
            Ok::<_, StoreError>(batch)
        })?;

        if batch.status.is_terminal() {
            info!(
                batch_id = %batch.id,
                status = %batch.status,
                completed = batch.completed_count,
                failed = batch.failed_count,
                "Batch settled"
            );
        }
        self.emit_batch(&batch);
        Ok(batch)
    }

    /// Stores a poll failure without touching the batch state.
    pub fn record_batch_poll_error(&self, batch_id: &str, error: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE qc_batches SET last_error = ?2, last_polled_at = ?3 WHERE id = ?1",
                params![batch_id, error, crate::db::format_timestamp(Utc::now())],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------

    /// Resets a CONVERSION_FAILED or NUMBERING_FAILED record to QUEUED.
    ///
    /// A record that still belongs to a batch is detached from it; the batch
    /// keeps the record in `original_batch_id` history only.
    pub fn retry_record(&self, id: &str, max_retries: u32) -> Result<QcRecord, StoreError> {
        let (record, batch) = self.db.with_transaction(|conn| {
            let mut record = record_repo::find_by_id(conn, id)?
                .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
            if !matches!(
                record.status,
                QcStatus::ConversionFailed | QcStatus::NumberingFailed
            ) {
                return Err(StoreError::RetryNotAllowed {
                    id: id.to_string(),
                    status: record.status,
                });
            }
            if record.retry_count >= max_retries {
                return Err(StoreError::RetryLimitExceeded {
                    id: id.to_string(),
                    limit: max_retries,
                });
            }
            check_edge(&record, QcStatus::Queued, TransitionKind::Retry)?;

            let previous_batch = record.batch_id.take();
            if let Some(batch_id) = &previous_batch {
                record.original_batch_id = Some(batch_id.clone());
            }
            record.status = QcStatus::Queued;
            record.retry_count += 1;
            reset_for_conversion(&mut record);
            record_repo::update(conn, &record)?;

            let batch = match previous_batch.as_deref() {
                Some(batch_id) => refresh_counters(conn, batch_id, 1)?,
                None => None,
            };
            Ok::<_, StoreError>((record, batch))
        })?;

        info!(qc_id = %record.id, retry_count = record.retry_count, "Record re-queued");
        self.emit_record(&record);
        if let Some(batch) = batch {
            self.emit_batch(&batch);
        }
        Ok(record)
    }

    /// Detaches every failed member of a FAILED or PARTIAL_COMPLETE batch.
    ///
    /// Each detached record goes back to CONVERTED when its rendition still
    /// exists and to QUEUED otherwise. `file_count` and the counters shrink
    /// in the same write, so the batch invariant holds throughout.
    pub fn detach_failed_from_batch(&self, batch_id: &str) -> Result<Vec<QcRecord>, StoreError> {
        let (records, batch) = self.db.with_transaction(|conn| {
            let batch = batch_repo::find_by_id(conn, batch_id)?
                .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
            if !matches!(
                batch.status,
                BatchStatus::Failed | BatchStatus::PartialComplete
            ) {
                return Err(StoreError::BatchRetryNotAllowed {
                    id: batch_id.to_string(),
                    reason: format!("batch is {}", batch.status),
                });
            }
            if batch.failed_count == 0 {
                return Err(StoreError::BatchRetryNotAllowed {
                    id: batch_id.to_string(),
                    reason: "batch has no failed files".to_string(),
                });
            }

            let now = Utc::now();
            let mut detached = Vec::new();
            for mut record in record_repo::list_by_batch(conn, batch_id)? {
                if !record.status.is_failure() {
                    continue;
                }
                let rendition_exists = record
                    .rendition_path
                    .as_deref()
                    .is_some_and(Path::exists);
                let target = if rendition_exists
                    && record
                        .status
                        .can_transition(QcStatus::Converted, TransitionKind::Retry)
                {
                    QcStatus::Converted
                } else {
                    QcStatus::Queued
                };
                check_edge(&record, target, TransitionKind::Retry)?;

                record.status = target;
                record.batch_id = None;
                record.original_batch_id = Some(batch_id.to_string());
                record.retry_count += 1;
                record.external_id = None;
                record.issues = IssueCounts::default();
                record.report_path = None;
                record.submitted_at = None;
                record.completed_at = None;
                record.error_message = None;
                if target == QcStatus::Queued {
                    reset_for_conversion(&mut record);
                } else {
                    record.converted_at = Some(now);
                }
                record.updated_at = now;
                record_repo::update(conn, &record)?;
                detached.push(record);
            }

            let batch = refresh_counters(conn, batch_id, detached.len() as u32)?
                .ok_or_else(|| StoreError::BatchNotFound(batch_id.to_string()))?;
            Ok::<_, StoreError>((detached, batch))
        })?;

        info!(
            batch_id = %batch_id,
            detached = records.len(),
            file_count = batch.file_count,
            "Failed files detached from batch"
        );
        for record in &records {
            self.emit_record(record);
        }
        self.emit_batch(&batch);
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Repairs state left behind by an unclean stop.
    ///
    /// Conversions that were running are marked failed, and batches that
    /// were being assembled but never accepted are discarded with their
    /// members returned to CONVERTED. Archive files of discarded batches are
    /// left to the caller.
    pub fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError> {
        let report = self.db.with_transaction(|conn| {
            let mut report = RecoveryReport::default();
            let now = Utc::now();

            for mut record in record_repo::list_by_status(conn, QcStatus::Converting)? {
                record.status = QcStatus::ConversionFailed;
                record.error_message = Some("conversion interrupted by shutdown".to_string());
                record.completed_at = Some(now);
                record.updated_at = now;
                record_repo::update(conn, &record)?;
                report.interrupted_conversions.push(record.id);
            }

            for batch in batch_repo::list(conn, Some(BatchStatus::Pending))? {
                let reverted = revert_pending_batch(conn, &batch.id, None)?;
                report
                    .reverted_records
                    .extend(reverted.into_iter().map(|r| r.id));
                report.discarded_batches.push(batch);
            }

            // Submitting members whose batch row vanished.
            for mut record in record_repo::list_by_status(conn, QcStatus::Submitting)? {
                let orphaned = match record.batch_id.as_deref() {
                    Some(batch_id) => batch_repo::find_by_id(conn, batch_id)?.is_none(),
                    None => true,
                };
                if !orphaned {
                    continue;
                }
                record.status = QcStatus::Converted;
                record.batch_id = None;
                record.updated_at = now;
                record_repo::update(conn, &record)?;
                report.reverted_records.push(record.id);
            }

            Ok::<_, StoreError>(report)
        })?;

        if !report.is_empty() {
            warn!(
                interrupted = report.interrupted_conversions.len(),
                reverted = report.reverted_records.len(),
                discarded_batches = report.discarded_batches.len(),
                "Recovered state from an unclean stop"
            );
        }
        Ok(report)
    }

    fn emit_record(&self, record: &QcRecord) {
        self.events.send(PipelineEvent::status_update(
            &record.id,
            record.status,
            record.error_message.as_deref(),
        ));
    }

    fn emit_batch(&self, batch: &QcBatch) {
        self.events.send(PipelineEvent::BatchUpdate {
            batch_id: batch.id.clone(),
            status: batch.status,
            completed: batch.completed_count,
            failed: batch.failed_count,
            processing: batch.processing_count,
        });
    }
}

fn check_edge(record: &QcRecord, to: QcStatus, kind: TransitionKind) -> Result<(), StoreError> {
    if record.status.can_transition(to, kind) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            id: record.id.clone(),
            from: record.status,
            to,
        })
    }
}

fn reset_for_conversion(record: &mut QcRecord) {
    record.rendition_path = None;
    record.error_message = None;
    record.processed_by = None;
    record.conversion_started_at = None;
    record.converted_at = None;
    record.completed_at = None;
    record.updated_at = Utc::now();
}

/// Terminal status of a batch with no member left in flight. A batch that
/// completed nothing, including one emptied by a purge, is FAILED.
fn settled_status(batch: &QcBatch) -> BatchStatus {
    if batch.completed_count == 0 {
        BatchStatus::Failed
    } else if batch.failed_count == 0 {
        BatchStatus::Completed
    } else {
        BatchStatus::PartialComplete
    }
}

/// Recomputes a batch's counters from its members, shrinking `file_count` by
/// `detached` in the same statement.
fn refresh_counters(
    conn: &Connection,
    batch_id: &str,
    detached: u32,
) -> Result<Option<QcBatch>, DatabaseError> {
    let (completed, failed, processing) = record_repo::batch_member_counts(conn, batch_id)?;
    conn.execute(
        "UPDATE qc_batches SET file_count = file_count - ?2, completed_count = ?3,
         failed_count = ?4, processing_count = ?5
         WHERE id = ?1",
        params![batch_id, detached, completed, failed, processing],
    )?;
    batch_repo::find_by_id(conn, batch_id)
}

fn revert_pending_batch(
    conn: &Connection,
    batch_id: &str,
    reason: Option<&str>,
) -> Result<Vec<QcRecord>, StoreError> {
    let now = Utc::now();
    let mut reverted = Vec::new();
    for mut record in record_repo::list_by_batch(conn, batch_id)? {
        if record.status != QcStatus::Submitting {
            continue;
        }
        check_edge(&record, QcStatus::Converted, TransitionKind::Revert)?;
        record.status = QcStatus::Converted;
        record.batch_id = None;
        record.error_message = reason.map(str::to_string);
        record.updated_at = now;
        record_repo::update(conn, &record)?;
        reverted.push(record);
    }
    batch_repo::delete_pending(conn, batch_id)?;
    Ok(reverted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> QcStore {
        QcStore::new(
            Database::open_in_memory().expect("in-memory db"),
            EventBroadcaster::new(64),
        )
    }

    fn new_record(store: &QcStore, name: &str) -> QcRecord {
        let record = QcRecord::new(
            PathBuf::from(format!("/watch/ch01/{}", name)),
            format!("sig-{}", name),
            Some(Path::new("/watch")),
        );
        store.create_record(record).unwrap().unwrap()
    }

    fn converted_record(store: &QcStore, name: &str, rendition: &Path) -> QcRecord {
        let record = new_record(store, name);
        store.mark_converting(&record.id).unwrap();
        store
            .mark_converted(&record.id, rendition, "fake#1")
            .unwrap()
    }

    fn submitted_batch(store: &QcStore, ids: &[String]) -> QcBatch {
        let (batch, _) = store
            .create_batch("b1", ids, Path::new("/out/b1.zip"))
            .unwrap()
            .unwrap();
        let jobs: HashMap<String, String> = batch
            .manifest
            .entries
            .iter()
            .map(|e| (e.entry_name.clone(), format!("job-{}", e.qc_id)))
            .collect();
        store.mark_batch_submitted(&batch.id, "remote-1", &jobs).unwrap()
    }

    fn finish(store: &QcStore, id: &str, ok: bool) {
        if ok {
            store.mark_downloading(id, IssueCounts::default()).unwrap();
            store.mark_completed(id, None).unwrap();
        } else {
            store.mark_failed(id, "remote failure").unwrap();
        }
    }

    #[test]
    fn test_create_record_is_idempotent() {
        let store = test_store();
        let record = new_record(&store, "q1.docx");
        let again = QcRecord::new(
            record.source_path.clone(),
            record.file_signature.clone(),
            Some(Path::new("/watch")),
        );
        assert!(store.create_record(again).unwrap().is_none());
        let latest = store.latest_for_source(&record.source_path).unwrap();
        assert_eq!(latest.unwrap().id, record.id);
    }

    #[test]
    fn test_transition_rejects_illegal_edges() {
        let store = test_store();
        let record = new_record(&store, "q1.docx");

        let err = store
            .mark_converted(&record.id, Path::new("/out/q1.pdf"), "fake#1")
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        assert_eq!(store.get_record(&record.id).unwrap().status, QcStatus::Queued);
    }

    #[test]
    fn test_transition_publishes_status_update() {
        let store = test_store();
        let mut rx = store.events().subscribe();
        let record = new_record(&store, "q1.docx");
        store.mark_converting(&record.id).unwrap();

        match rx.try_recv().unwrap() {
            PipelineEvent::StatusUpdate { qc_id, status, .. } => {
                assert_eq!(qc_id, record.id);
                assert_eq!(status, QcStatus::Converting);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_create_batch_claims_only_free_records() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        let b = converted_record(&store, "b.docx", Path::new("/out/b.pdf"));
        let ids = vec![a.id.clone(), b.id.clone()];

        let (batch, members) = store
            .create_batch("b1", &ids, Path::new("/out/b1.zip"))
            .unwrap()
            .unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(batch.file_count, 2);
        assert_eq!(batch.processing_count, 2);
        assert_eq!(store.get_record(&a.id).unwrap().status, QcStatus::Submitting);

        // A second pass over the same candidates claims nothing.
        let second = store
            .create_batch("b2", &ids, Path::new("/out/b2.zip"))
            .unwrap();
        assert!(second.is_none());
        assert!(store.get_batch("b2").is_err());
    }

    #[test]
    fn test_submission_assigns_external_ids() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        let batch = submitted_batch(&store, &[a.id.clone()]);

        assert_eq!(batch.status, BatchStatus::Submitted);
        assert_eq!(batch.remote_batch_id.as_deref(), Some("remote-1"));
        let record = store.get_record(&a.id).unwrap();
        assert_eq!(record.status, QcStatus::Processing);
        assert_eq!(record.external_id, Some(format!("job-{}", a.id)));
        assert!(record.submitted_at.is_some());
    }

    #[test]
    fn test_discard_batch_reverts_members() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        store
            .create_batch("b1", &[a.id.clone()], Path::new("/out/b1.zip"))
            .unwrap();

        let reverted = store.discard_batch("b1", "remote unavailable").unwrap();
        assert_eq!(reverted.len(), 1);
        let record = store.get_record(&a.id).unwrap();
        assert_eq!(record.status, QcStatus::Converted);
        assert!(record.batch_id.is_none());
        assert!(store.get_batch("b1").is_err());
        assert_eq!(store.eligible_for_batching().unwrap().len(), 1);
    }

    #[test]
    fn test_batch_settles_after_last_verdict() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        let b = converted_record(&store, "b.docx", Path::new("/out/b.pdf"));
        submitted_batch(&store, &[a.id.clone(), b.id.clone()]);

        finish(&store, &a.id, true);
        let batch = store.update_batch_progress("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
        assert_eq!(batch.completed_count, 1);
        assert_eq!(batch.processing_count, 1);

        finish(&store, &b.id, false);
        let batch = store.update_batch_progress("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::PartialComplete);
        assert_eq!(batch.failed_count, 1);
        assert!(batch.completed_at.is_some());
        assert!(batch.counters_consistent());
    }

    #[test]
    fn test_settled_status_rules() {
        let mut batch = QcBatch::pending("b".into(), PathBuf::new(), 0, BatchManifest::new("b"));
        batch.file_count = 2;
        batch.completed_count = 2;
        assert_eq!(settled_status(&batch), BatchStatus::Completed);
        batch.completed_count = 0;
        batch.failed_count = 2;
        assert_eq!(settled_status(&batch), BatchStatus::Failed);
        batch.completed_count = 1;
        batch.failed_count = 1;
        assert_eq!(settled_status(&batch), BatchStatus::PartialComplete);
        batch.completed_count = 0;
        batch.failed_count = 0;
        assert_eq!(settled_status(&batch), BatchStatus::Failed);
    }

    #[test]
    fn test_purged_batch_does_not_settle_as_completed() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        let b = converted_record(&store, "b.docx", Path::new("/out/b.pdf"));
        submitted_batch(&store, &[a.id.clone(), b.id.clone()]);

        assert_eq!(store.delete_all_records().unwrap(), 2);
        let batch = store.update_batch_progress("b1").unwrap();
        assert_eq!(batch.processing_count, 0);
        assert_eq!(batch.completed_count, 0);
        assert_eq!(batch.status, BatchStatus::Failed);
        assert!(batch.completed_at.is_some());
    }

    #[test]
    fn test_poll_error_keeps_state() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        submitted_batch(&store, &[a.id.clone()]);

        store.record_batch_poll_error("b1", "timeout").unwrap();
        let batch = store.get_batch("b1").unwrap();
        assert_eq!(batch.status, BatchStatus::Submitted);
        assert_eq!(batch.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_retry_record_respects_status_and_limit() {
        let store = test_store();
        let record = new_record(&store, "q1.docx");
        assert!(matches!(
            store.retry_record(&record.id, 3),
            Err(StoreError::RetryNotAllowed { .. })
        ));

        store.mark_converting(&record.id).unwrap();
        store
            .mark_conversion_failed(&record.id, "engine crashed", Some("fake#1"))
            .unwrap();
        let retried = store.retry_record(&record.id, 1).unwrap();
        assert_eq!(retried.status, QcStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error_message.is_none());

        store.mark_converting(&record.id).unwrap();
        store
            .mark_conversion_failed(&record.id, "engine crashed", None)
            .unwrap();
        assert!(matches!(
            store.retry_record(&record.id, 1),
            Err(StoreError::RetryLimitExceeded { limit: 1, .. })
        ));
    }

    #[test]
    fn test_retry_record_detaches_from_batch() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        let b = converted_record(&store, "b.docx", Path::new("/out/b.pdf"));
        submitted_batch(&store, &[a.id.clone(), b.id.clone()]);
        store.mark_numbering_failed(&a.id, "numbering gap").unwrap();

        let retried = store.retry_record(&a.id, 3).unwrap();
        assert!(retried.batch_id.is_none());
        assert_eq!(retried.original_batch_id.as_deref(), Some("b1"));

        let batch = store.get_batch("b1").unwrap();
        assert_eq!(batch.file_count, 1);
        assert_eq!(batch.failed_count, 0);
        assert_eq!(batch.processing_count, 1);
        assert!(batch.counters_consistent());
    }

    #[test]
    fn test_detach_failed_requires_failed_files() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        submitted_batch(&store, &[a.id.clone()]);
        assert!(matches!(
            store.detach_failed_from_batch("b1"),
            Err(StoreError::BatchRetryNotAllowed { .. })
        ));

        finish(&store, &a.id, true);
        store.update_batch_progress("b1").unwrap();
        assert!(matches!(
            store.detach_failed_from_batch("b1"),
            Err(StoreError::BatchRetryNotAllowed { .. })
        ));
    }

    #[test]
    fn test_detach_failed_targets_by_rendition() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.pdf");
        std::fs::write(&kept, b"%PDF").unwrap();

        let store = test_store();
        let ok = converted_record(&store, "ok.docx", &kept);
        let with_pdf = converted_record(&store, "with.docx", &kept);
        let without_pdf = converted_record(&store, "without.docx", &dir.path().join("gone.pdf"));
        submitted_batch(
            &store,
            &[ok.id.clone(), with_pdf.id.clone(), without_pdf.id.clone()],
        );
        finish(&store, &ok.id, true);
        finish(&store, &with_pdf.id, false);
        finish(&store, &without_pdf.id, false);
        store.update_batch_progress("b1").unwrap();

        let detached = store.detach_failed_from_batch("b1").unwrap();
        assert_eq!(detached.len(), 2);

        let with_pdf = store.get_record(&with_pdf.id).unwrap();
        assert_eq!(with_pdf.status, QcStatus::Converted);
        assert_eq!(with_pdf.original_batch_id.as_deref(), Some("b1"));
        let without_pdf = store.get_record(&without_pdf.id).unwrap();
        assert_eq!(without_pdf.status, QcStatus::Queued);
        assert!(without_pdf.rendition_path.is_none());

        let batch = store.get_batch("b1").unwrap();
        assert_eq!(batch.file_count, 1);
        assert_eq!(batch.failed_count, 0);
        assert_eq!(batch.completed_count, 1);
        assert_eq!(store.get_record(&ok.id).unwrap().status, QcStatus::Completed);
    }

    #[test]
    fn test_recover_interrupted() {
        let store = test_store();
        let converting = new_record(&store, "c.docx");
        store.mark_converting(&converting.id).unwrap();
        let pending = converted_record(&store, "p.docx", Path::new("/out/p.pdf"));
        store
            .create_batch("b1", &[pending.id.clone()], Path::new("/out/b1.zip"))
            .unwrap();

        let report = store.recover_interrupted().unwrap();
        assert_eq!(report.interrupted_conversions, vec![converting.id.clone()]);
        assert_eq!(report.reverted_records, vec![pending.id.clone()]);
        assert_eq!(report.discarded_batches.len(), 1);

        assert_eq!(
            store.get_record(&converting.id).unwrap().status,
            QcStatus::ConversionFailed
        );
        assert_eq!(store.get_record(&pending.id).unwrap().status, QcStatus::Converted);
        assert!(store.recover_interrupted().unwrap().is_empty());
    }

    #[test]
    fn test_delete_record_shrinks_batch() {
        let store = test_store();
        let a = converted_record(&store, "a.docx", Path::new("/out/a.pdf"));
        let b = converted_record(&store, "b.docx", Path::new("/out/b.pdf"));
        submitted_batch(&store, &[a.id.clone(), b.id.clone()]);

        store.delete_record(&a.id).unwrap();
        let batch = store.get_batch("b1").unwrap();
        assert_eq!(batch.file_count, 1);
        assert!(batch.counters_consistent());
        assert!(matches!(
            store.delete_record(&a.id),
            Err(StoreError::RecordNotFound(_))
        ));
    }
}
