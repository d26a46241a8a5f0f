//! In-process stand-ins for the conversion engine and the QC service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lopdf::{dictionary, Document, Object, Stream};

use docqc::error::ConversionError;
use docqc::model::BatchManifest;
use docqc::remote::{
    BatchStatusResponse, FileState, FileVerdict, JobAssignment, SubmitResponse,
};
use docqc::{ConversionEngine, DocumentHandle, IssueCounts, QcApi, RemoteError};

/// Writes a one-page PDF.
pub fn write_pdf(path: &Path) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let content_id = doc.add_object(Stream::new(dictionary! {}, b"BT ET".to_vec()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::from(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).expect("Failed to write PDF");
}

/// What the engine has been asked to do so far.
#[derive(Debug, Default)]
pub struct EngineLog {
    pub initialized: u32,
    pub shutdowns: u32,
    pub exported: Vec<PathBuf>,
    pub open_documents: u32,
    pub max_open_documents: u32,
}

/// Converts everything except sources whose name starts with `broken`.
pub struct ScriptedEngine {
    log: Arc<Mutex<EngineLog>>,
    next_id: u64,
}

impl ScriptedEngine {
    pub fn new() -> (Self, Arc<Mutex<EngineLog>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        (
            Self {
                log: Arc::clone(&log),
                next_id: 0,
            },
            log,
        )
    }
}

impl ConversionEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn initialize(&mut self) -> Result<(), ConversionError> {
        self.log.lock().unwrap().initialized += 1;
        Ok(())
    }

    fn open(&mut self, source: &Path) -> Result<DocumentHandle, ConversionError> {
        let mut log = self.log.lock().unwrap();
        log.open_documents += 1;
        log.max_open_documents = log.max_open_documents.max(log.open_documents);
        self.next_id += 1;
        Ok(DocumentHandle {
            id: self.next_id,
            source: source.to_path_buf(),
        })
    }

    fn export(&mut self, doc: &DocumentHandle, dest: &Path) -> Result<(), ConversionError> {
        let broken = doc
            .source
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("broken"))
            .unwrap_or(false);
        if broken {
            return Err(ConversionError::Export {
                path: doc.source.clone(),
                reason: "document is corrupt".to_string(),
            });
        }
        write_pdf(dest);
        self.log.lock().unwrap().exported.push(doc.source.clone());
        Ok(())
    }

    fn close(&mut self, _doc: DocumentHandle) -> Result<(), ConversionError> {
        self.log.lock().unwrap().open_documents -= 1;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ConversionError> {
        self.log.lock().unwrap().shutdowns += 1;
        Ok(())
    }

    fn force_terminate(&mut self) -> Result<(), ConversionError> {
        Ok(())
    }
}

/// Accepts every batch and reports a verdict for every file on the first
/// status request. Files named in `fail_files` come back FAILED.
#[derive(Default)]
pub struct AutoQcApi {
    batches: Mutex<HashMap<String, BatchManifest>>,
    fail_files: Mutex<HashSet<String>>,
}

impl AutoQcApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_file(&self, original_name: &str) {
        self.fail_files
            .lock()
            .unwrap()
            .insert(original_name.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_files.lock().unwrap().clear();
    }

    pub fn submission_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Names of every file submitted so far, across batches.
    pub fn submitted_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .batches
            .lock()
            .unwrap()
            .values()
            .flat_map(|m| m.entries.iter().map(|e| e.original_name.clone()))
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl QcApi for AutoQcApi {
    async fn submit_batch(
        &self,
        archive: &Path,
        manifest: &BatchManifest,
    ) -> Result<SubmitResponse, RemoteError> {
        assert!(archive.is_file(), "archive must exist when submitted");
        let mut batches = self.batches.lock().unwrap();
        let remote_id = format!("remote-{}", batches.len() + 1);
        batches.insert(remote_id.clone(), manifest.clone());
        Ok(SubmitResponse {
            batch_id: remote_id,
            jobs: manifest
                .entries
                .iter()
                .map(|e| JobAssignment {
                    entry_name: e.entry_name.clone(),
                    job_id: format!("job-{}", e.qc_id),
                })
                .collect(),
        })
    }

    async fn get_batch_status(
        &self,
        remote_batch_id: &str,
    ) -> Result<BatchStatusResponse, RemoteError> {
        let batches = self.batches.lock().unwrap();
        let manifest = batches
            .get(remote_batch_id)
            .ok_or_else(|| RemoteError::Status {
                code: 404,
                body: "unknown batch".to_string(),
            })?;
        let failing = self.fail_files.lock().unwrap();

        let files: Vec<FileVerdict> = manifest
            .entries
            .iter()
            .map(|e| {
                let failed = failing.contains(&e.original_name);
                FileVerdict {
                    entry_name: e.entry_name.clone(),
                    job_id: Some(format!("job-{}", e.qc_id)),
                    state: if failed {
                        FileState::Failed
                    } else {
                        FileState::Completed
                    },
                    issues: IssueCounts {
                        critical: 0,
                        major: 1,
                        minor: 3,
                    },
                    report_url: (!failed)
                        .then(|| format!("https://qc.test/reports/{}.pdf", e.qc_id)),
                    error: failed.then(|| "numbering check failed remotely".to_string()),
                }
            })
            .collect();
        let failed = files
            .iter()
            .filter(|f| f.state == FileState::Failed)
            .count() as u32;
        Ok(BatchStatusResponse {
            status: "completed".to_string(),
            completed: files.len() as u32 - failed,
            failed,
            success_rate: None,
            files,
        })
    }

    async fn download_report(&self, _url: &str, dest: &Path) -> Result<u64, RemoteError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RemoteError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(dest, b"%PDF-report").map_err(|e| RemoteError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
        Ok(11)
    }
}
