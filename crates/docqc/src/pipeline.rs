//! Wiring of the pipeline stages and their background loops.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchAssembler, BatchPoller, RetryCoordinator};
use crate::config::Config;
use crate::conversion::{
    ConversionEngine, ConversionJob, ConversionQueue, ConversionWorkerConfig, StructureCheck,
};
use crate::db::Database;
use crate::error::DocQcError;
use crate::events::EventBroadcaster;
use crate::remote::QcApi;
use crate::service::QcService;
use crate::store::QcStore;
use crate::watcher::{DocumentFilter, FolderWatcher, Ingestor};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Runs batch assembly and status polling on fixed intervals.
pub struct BatchScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BatchScheduler {
    /// Spawns the scheduler onto the current Tokio runtime.
    pub fn spawn(
        assembler: Arc<BatchAssembler>,
        poller: Arc<BatchPoller>,
        assemble_interval: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut assemble_timer = tokio::time::interval(assemble_interval);
            let mut poll_timer = tokio::time::interval(poll_interval);
            assemble_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = assemble_timer.tick() => {
                        match assembler.assemble_ready().await {
                            Ok(batches) if !batches.is_empty() => {
                                info!(submitted = batches.len(), "Batches submitted");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Batch assembly failed"),
                        }
                    }
                    _ = poll_timer.tick() => {
                        if let Err(e) = poller.poll_once().await {
                            warn!(error = %e, "Batch poll failed");
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            debug!("Batch scheduler stopped");
        });

        Self { shutdown, handle }
    }

    /// Stops after the tick in progress and waits for the task.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Batch scheduler task failed: {}", e);
        }
    }
}

/// Everything a pipeline needs from the outside world.
pub struct PipelineDeps {
    pub database: Database,
    pub engine: Box<dyn ConversionEngine>,
    pub api: Arc<dyn QcApi>,
    pub check: Arc<dyn StructureCheck>,
}

pub struct Pipeline {
    service: QcService,
    store: QcStore,
    queue: ConversionQueue,
    scheduler: BatchScheduler,
}

impl Pipeline {
    /// Recovers state left by an unclean stop, starts the conversion worker,
    /// re-enqueues waiting records, starts the batch scheduler and watches
    /// the configured folders.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &Config, deps: PipelineDeps) -> Result<Self, DocQcError> {
        let output_dir = config.output_dir();
        std::fs::create_dir_all(&output_dir).map_err(|e| DocQcError::Io {
            path: output_dir.clone(),
            source: e,
        })?;
        let output_dir = output_dir.canonicalize().unwrap_or(output_dir);
        let events = EventBroadcaster::new(EVENT_CHANNEL_CAPACITY);
        let store = QcStore::new(deps.database, events.clone());

        let recovery = store.recover_interrupted()?;
        for batch in &recovery.discarded_batches {
            if batch.archive_path.exists() {
                if let Err(e) = std::fs::remove_file(&batch.archive_path) {
                    warn!(batch_id = %batch.id, error = %e, "Failed to remove stale archive");
                }
            }
        }

        let queue = ConversionQueue::start(
            deps.engine,
            store.clone(),
            deps.check,
            ConversionWorkerConfig {
                output_directory: output_dir.clone(),
                max_conversions_per_session: config.conversion.max_conversions_per_session,
                escalate_after_failures: config.conversion.escalate_after_failures,
            },
        )?;

        let waiting = store.queued_records()?;
        if !waiting.is_empty() {
            info!(count = waiting.len(), "Re-enqueuing records waiting for conversion");
        }
        for record in waiting {
            queue.submit(ConversionJob::new(&record.id, &record.source_path))?;
        }

        let submitter = queue.submitter();
        let filter = DocumentFilter::new(&config.watcher, Some(&output_dir))?;
        let watcher = Arc::new(FolderWatcher::new(
            Ingestor::new(store.clone(), submitter.clone()),
            filter,
            config.watcher.clone(),
            events,
        ));
        let retry = RetryCoordinator::new(store.clone(), submitter.clone(), config.retry.max_retries);

        let assembler = Arc::new(BatchAssembler::new(
            store.clone(),
            Arc::clone(&deps.api),
            config.batch.clone(),
            config.archives_dir(),
        ));
        let poller = Arc::new(BatchPoller::new(store.clone(), deps.api, config.reports_dir()));
        let scheduler = BatchScheduler::spawn(
            assembler,
            poller,
            Duration::from_secs(config.batch.assemble_interval_secs.max(1)),
            Duration::from_secs(config.api.poll_interval_secs.max(1)),
        );

        let service = QcService::new(store.clone(), watcher, retry, submitter);
        for folder in config.watch_dirs() {
            // The failure is already published as an error event.
            if let Err(e) = service.watcher_start(&folder) {
                error!(folder = %folder.display(), error = %e, "Failed to watch folder");
            }
        }

        info!(output = %output_dir.display(), "Pipeline started");
        Ok(Self {
            service,
            store,
            queue,
            scheduler,
        })
    }

    pub fn service(&self) -> &QcService {
        &self.service
    }

    pub fn store(&self) -> &QcStore {
        &self.store
    }

    /// Stops watching, lets the scheduler finish its tick and the current
    /// conversion complete, then shuts the conversion session down.
    pub async fn shutdown(self) {
        info!("Shutting down pipeline...");
        self.service.watcher_stop();
        self.scheduler.stop().await;

        let queue = self.queue;
        if let Err(e) = tokio::task::spawn_blocking(move || queue.wait()).await {
            error!("Conversion queue shutdown failed: {}", e);
        }
        info!("Pipeline stopped");
    }
}

/// Directory for the conversion engine's private profile.
pub fn engine_profile_dir(config: &Config) -> PathBuf {
    config.output_dir().join(".engine-profile")
}
