use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, info_span, warn};

use super::{rendition_path, verify_rendition, ConversionEngine, SessionManager, StructureCheck};
use crate::error::{ConversionError, StoreError};
use crate::events::{EventBroadcaster, PipelineEvent};
use crate::sanitize::redact_path;
use crate::store::QcStore;

/// A request to convert the source of one QC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub qc_id: String,
    pub source_path: PathBuf,
}

impl ConversionJob {
    pub fn new(qc_id: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            qc_id: qc_id.into(),
            source_path: source_path.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionWorkerConfig {
    pub output_directory: PathBuf,
    pub max_conversions_per_session: u32,
    pub escalate_after_failures: u32,
}

/// Cloneable handle for appending jobs to the queue.
#[derive(Clone)]
pub struct ConversionSubmitter {
    sender: Sender<ConversionJob>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    events: EventBroadcaster,
}

impl ConversionSubmitter {
    pub fn submit(&self, job: ConversionJob) -> Result<(), ConversionError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(ConversionError::QueueStopped);
        }

        let length = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if self.sender.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ConversionError::QueueStopped);
        }
        self.events.send(PipelineEvent::QueueUpdate { length });
        Ok(())
    }

    /// Jobs waiting behind the current conversion.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Strict FIFO of conversion jobs drained by one dedicated thread.
///
/// The worker thread owns the [`SessionManager`], so the automation session
/// is never used concurrently.
pub struct ConversionQueue {
    submitter: ConversionSubmitter,
    worker: JoinHandle<()>,
}

impl ConversionQueue {
    pub fn start(
        engine: Box<dyn ConversionEngine>,
        store: QcStore,
        check: Arc<dyn StructureCheck>,
        config: ConversionWorkerConfig,
    ) -> Result<Self, ConversionError> {
        let (sender, receiver) = unbounded::<ConversionJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let events = store.events().clone();

        let session = SessionManager::new(engine, config.max_conversions_per_session);
        let worker = Worker {
            receiver,
            pending: Arc::clone(&pending),
            shutdown: Arc::clone(&shutdown),
            events: events.clone(),
            session,
            store,
            check,
            config,
            failure_streak: 0,
        };

        let worker = thread::Builder::new()
            .name("docqc-conversion".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                ConversionError::SessionInit(format!("failed to spawn conversion worker: {}", e))
            })?;

        info!("Conversion queue started");

        Ok(Self {
            submitter: ConversionSubmitter {
                sender,
                pending,
                shutdown,
                events,
            },
            worker,
        })
    }

    pub fn submitter(&self) -> ConversionSubmitter {
        self.submitter.clone()
    }

    pub fn submit(&self, job: ConversionJob) -> Result<(), ConversionError> {
        self.submitter.submit(job)
    }

    pub fn len(&self) -> usize {
        self.submitter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.submitter.is_empty()
    }

    /// Stops accepting jobs. The current conversion still finishes.
    pub fn stop(&self) {
        info!("Stopping conversion queue...");
        self.submitter.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.submitter.is_stopped()
    }

    /// Stops the queue and joins the worker.
    pub fn wait(self) {
        self.stop();
        if let Err(e) = self.worker.join() {
            error!("Conversion worker panicked: {:?}", e);
        } else {
            info!("Conversion queue stopped");
        }
    }
}

struct Worker {
    receiver: Receiver<ConversionJob>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    events: EventBroadcaster,
    session: SessionManager,
    store: QcStore,
    check: Arc<dyn StructureCheck>,
    config: ConversionWorkerConfig,
    failure_streak: u32,
}

impl Worker {
    fn run(mut self) {
        debug!("Conversion worker started");

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Conversion worker received shutdown signal");
                break;
            }

            match self.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(job) => {
                    let length = self
                        .pending
                        .fetch_sub(1, Ordering::SeqCst)
                        .saturating_sub(1);
                    self.events.send(PipelineEvent::QueueUpdate { length });
                    self.process(job);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Conversion job channel disconnected");
                    break;
                }
            }
        }

        self.session.shutdown();
        debug!("Conversion worker stopped");
    }

    fn process(&mut self, job: ConversionJob) {
        let _span = info_span!(
            "conversion",
            qc_id = %job.qc_id,
            file = %redact_path(&job.source_path)
        )
        .entered();

        let record = match self.store.mark_converting(&job.qc_id) {
            Ok(record) => record,
            Err(StoreError::RecordNotFound(_)) => {
                debug!("Record deleted before conversion, skipping");
                return;
            }
            Err(StoreError::IllegalTransition { from, .. }) => {
                debug!(status = %from, "Record no longer queued, skipping");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to mark record converting");
                return;
            }
        };

        let dest = rendition_path(&self.config.output_directory, &record);
        let result = self
            .session
            .convert(&record.source_path, &dest)
            .and_then(|()| verify_rendition(&dest));
        let engine = self.session.engine_label();

        match result {
            Ok(pages) => {
                self.failure_streak = 0;
                let record = match self.store.mark_converted(&record.id, &dest, &engine) {
                    Ok(record) => record,
                    Err(e) => {
                        error!(error = %e, "Failed to store conversion result");
                        return;
                    }
                };
                info!(pages, engine = %engine, "Document converted");

                if let Err(reason) = self.check.check(&record, &dest) {
                    warn!(reason = %reason, "Rendition failed structure check");
                    if let Err(e) = self.store.mark_numbering_failed(&record.id, &reason) {
                        error!(error = %e, "Failed to store structure check result");
                    }
                }
            }
            Err(e) => {
                self.failure_streak += 1;
                warn!(error = %e, streak = self.failure_streak, "Conversion failed");
                if dest.exists() {
                    let _ = std::fs::remove_file(&dest);
                }
                if let Err(store_err) =
                    self.store
                        .mark_conversion_failed(&record.id, &e.to_string(), Some(&engine))
                {
                    error!(error = %store_err, "Failed to store conversion failure");
                }

                let threshold = self.config.escalate_after_failures.max(1);
                if self.failure_streak % threshold == 0 {
                    self.events.error(format!(
                        "{} consecutive conversions failed; last error: {}",
                        self.failure_streak, e
                    ));
                }
            }
        }
    }
}
