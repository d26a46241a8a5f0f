//! Operations exposed to the UI shell.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::batch::RetryCoordinator;
use crate::conversion::ConversionSubmitter;
use crate::db::record_repo::RecordFilter;
use crate::db::stats_repo::QcStats;
use crate::error::DocQcError;
use crate::events::PipelineEvent;
use crate::model::{BatchStatus, QcBatch, QcRecord};
use crate::store::{QcStore, RecordPage};
use crate::watcher::{FolderWatcher, ScanSummary, WatcherStatus};

pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const MAX_PAGE_SIZE: u64 = 500;

/// Cloneable handle over the running pipeline.
#[derive(Clone)]
pub struct QcService {
    store: QcStore,
    watcher: Arc<FolderWatcher>,
    retry: RetryCoordinator,
    submitter: ConversionSubmitter,
}

impl QcService {
    pub fn new(
        store: QcStore,
        watcher: Arc<FolderWatcher>,
        retry: RetryCoordinator,
        submitter: ConversionSubmitter,
    ) -> Self {
        Self {
            store,
            watcher,
            retry,
            submitter,
        }
    }

    pub fn watcher_start(&self, path: &Path) -> Result<ScanSummary, DocQcError> {
        Ok(self.watcher.start(path)?)
    }

    pub fn watcher_stop(&self) {
        self.watcher.stop();
    }

    pub fn watcher_stop_folder(&self, path: &Path) -> bool {
        self.watcher.stop_folder(path)
    }

    pub fn watcher_status(&self) -> WatcherStatus {
        self.watcher.status()
    }

    /// A `limit` of 0 selects the default page size.
    pub fn get_records(
        &self,
        filter: &RecordFilter,
        limit: u64,
        offset: u64,
    ) -> Result<RecordPage, DocQcError> {
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        Ok(self.store.get_records(filter, limit, offset)?)
    }

    pub fn get_record(&self, id: &str) -> Result<QcRecord, DocQcError> {
        Ok(self.store.get_record(id)?)
    }

    pub fn get_stats(&self) -> Result<QcStats, DocQcError> {
        Ok(self.store.stats()?)
    }

    pub fn retry_record(&self, id: &str) -> Result<QcRecord, DocQcError> {
        Ok(self.retry.retry_record(id)?)
    }

    pub fn delete_record(&self, id: &str) -> Result<(), DocQcError> {
        Ok(self.store.delete_record(id)?)
    }

    pub fn delete_all_records(&self) -> Result<u64, DocQcError> {
        Ok(self.store.delete_all_records()?)
    }

    pub fn get_batches(&self, status: Option<BatchStatus>) -> Result<Vec<QcBatch>, DocQcError> {
        Ok(self.store.get_batches(status)?)
    }

    pub fn get_batch_files(&self, batch_id: &str) -> Result<Vec<QcRecord>, DocQcError> {
        Ok(self.store.get_batch_files(batch_id)?)
    }

    pub fn retry_batch(&self, batch_id: &str) -> Result<Vec<QcRecord>, DocQcError> {
        Ok(self.retry.retry_batch(batch_id)?)
    }

    /// Conversion jobs waiting behind the current one.
    pub fn queue_length(&self) -> usize {
        self.submitter.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.store.events().subscribe()
    }
}
