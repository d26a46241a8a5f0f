//! Serialized document conversion.
//!
//! A [`ConversionEngine`] wraps one exclusive, stateful automation session.
//! The [`session::SessionManager`] owns the engine and applies the restart
//! policies; the [`queue::ConversionQueue`] owns the session manager on a
//! single worker thread and drains jobs in FIFO order.

pub mod queue;
pub mod session;
pub mod soffice;

use std::path::{Path, PathBuf};

use crate::error::ConversionError;
use crate::model::QcRecord;

pub use queue::{ConversionJob, ConversionQueue, ConversionSubmitter, ConversionWorkerConfig};
pub use session::{SessionManager, SessionState};
pub use soffice::SofficeEngine;

/// A source document opened inside the automation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub id: u64,
    pub source: PathBuf,
}

/// Bridge to an external document-automation engine.
///
/// Implementations are driven from one thread at a time and never see two
/// open documents at once.
pub trait ConversionEngine: Send {
    /// Short engine name used in `processed_by`.
    fn name(&self) -> &str;

    /// Starts a hidden session.
    fn initialize(&mut self) -> Result<(), ConversionError>;

    /// Opens `source` read-only.
    fn open(&mut self, source: &Path) -> Result<DocumentHandle, ConversionError>;

    /// Exports an opened document as PDF to `dest`.
    fn export(&mut self, doc: &DocumentHandle, dest: &Path) -> Result<(), ConversionError>;

    /// Closes an opened document without saving.
    fn close(&mut self, doc: DocumentHandle) -> Result<(), ConversionError>;

    /// Ends the session gracefully.
    fn shutdown(&mut self) -> Result<(), ConversionError>;

    /// Kills every process of the engine by name.
    fn force_terminate(&mut self) -> Result<(), ConversionError>;
}

/// Post-conversion structure validation of a rendition.
///
/// A rejection marks the record NUMBERING_FAILED rather than
/// CONVERSION_FAILED.
pub trait StructureCheck: Send + Sync {
    fn check(&self, record: &QcRecord, rendition: &Path) -> Result<(), String>;
}

/// Accepts every rendition.
pub struct NoopCheck;

impl StructureCheck for NoopCheck {
    fn check(&self, _record: &QcRecord, _rendition: &Path) -> Result<(), String> {
        Ok(())
    }
}

/// Checks that a rendition is a readable PDF with at least one page and
/// returns its page count.
pub fn verify_rendition(path: &Path) -> Result<usize, ConversionError> {
    let invalid = |reason: String| ConversionError::RenditionInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let doc = lopdf::Document::load(path).map_err(|e| invalid(e.to_string()))?;
    let pages = doc.get_pages().len();
    if pages == 0 {
        return Err(invalid("document has no pages".to_string()));
    }
    Ok(pages)
}

/// Where the rendition of a record is written.
pub fn rendition_path(output_directory: &Path, record: &QcRecord) -> PathBuf {
    output_directory
        .join("renditions")
        .join(format!("{}.pdf", record.id))
}
