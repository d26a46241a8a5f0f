//! The single exclusive automation session and its restart policies.

use std::path::Path;

use tracing::{debug, error, info, warn};

use super::{ConversionEngine, DocumentHandle};
use crate::error::ConversionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Converting,
    Failed,
}

/// Owns the engine and enforces one conversion at a time.
///
/// After `max_conversions` successful conversions the next `convert` is
/// preceded by one restart. A session reported dead is force-terminated
/// and re-initialized lazily.
pub struct SessionManager {
    engine: Box<dyn ConversionEngine>,
    state: SessionState,
    max_conversions: u32,
    conversions: u32,
    generation: u64,
    restarts: u64,
}

impl SessionManager {
    pub fn new(engine: Box<dyn ConversionEngine>, max_conversions: u32) -> Self {
        Self {
            engine,
            state: SessionState::Uninitialized,
            max_conversions: max_conversions.max(1),
            conversions: 0,
            generation: 0,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Successful conversions since the session was (re)initialized.
    pub fn conversion_count(&self) -> u32 {
        self.conversions
    }

    /// Number of sessions started so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Scheduled and crash restarts performed so far.
    pub fn restart_count(&self) -> u64 {
        self.restarts
    }

    /// `engine#generation`, stored as `processed_by` on records.
    pub fn engine_label(&self) -> String {
        format!("{}#{}", self.engine.name(), self.generation)
    }

    pub fn initialize(&mut self) -> Result<(), ConversionError> {
        match self.engine.initialize() {
            Ok(()) => {
                self.generation += 1;
                self.conversions = 0;
                self.state = SessionState::Ready;
                info!(
                    engine = self.engine.name(),
                    generation = self.generation,
                    "Automation session started"
                );
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!(engine = self.engine.name(), error = %e, "Automation session failed to start");
                Err(e)
            }
        }
    }

    /// Converts `source` into a PDF at `dest`.
    pub fn convert(&mut self, source: &Path, dest: &Path) -> Result<(), ConversionError> {
        if !source.is_file() {
            return Err(ConversionError::SourceMissing(source.to_path_buf()));
        }

        match self.state {
            SessionState::Ready if self.conversions >= self.max_conversions => {
                info!(
                    conversions = self.conversions,
                    "Conversion limit reached, restarting session"
                );
                self.restart()?;
            }
            SessionState::Ready => {}
            SessionState::Uninitialized => self.initialize()?,
            SessionState::Failed | SessionState::Converting => {
                warn!("Recovering failed automation session");
                self.restart()?;
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConversionError::Export {
                path: source.to_path_buf(),
                reason: format!("cannot create {}: {}", parent.display(), e),
            })?;
        }

        self.state = SessionState::Converting;
        let result = self.run_conversion(source, dest);
        match &result {
            Ok(()) => {
                self.conversions += 1;
                self.state = SessionState::Ready;
            }
            Err(e) if e.is_session_fatal() => {
                warn!(error = %e, "Automation session died during conversion");
                self.state = SessionState::Failed;
            }
            Err(_) => self.state = SessionState::Ready,
        }
        result
    }

    fn run_conversion(&mut self, source: &Path, dest: &Path) -> Result<(), ConversionError> {
        let doc: DocumentHandle = self.engine.open(source)?;
        let exported = self.engine.export(&doc, dest);
        // The source is closed on every exit path, even after a failed export.
        if let Err(e) = self.engine.close(doc) {
            warn!(error = %e, "Failed to close source document");
            if exported.is_ok() && e.is_session_fatal() {
                return Err(e);
            }
        }
        exported
    }

    /// Shuts the session down and starts a fresh one.
    pub fn restart(&mut self) -> Result<(), ConversionError> {
        self.restarts += 1;
        self.stop_session();
        self.initialize()
    }

    /// Shuts the session down for good.
    pub fn shutdown(&mut self) {
        self.stop_session();
        debug!("Session manager shut down");
    }

    /// Graceful shutdown, falling back to killing the process by name.
    fn stop_session(&mut self) {
        if self.state == SessionState::Uninitialized {
            return;
        }
        let graceful = if self.state == SessionState::Failed {
            Err(ConversionError::SessionDead("session in failed state".to_string()))
        } else {
            self.engine.shutdown()
        };
        if let Err(e) = graceful {
            warn!(error = %e, "Graceful session shutdown failed, force-terminating");
            if let Err(e) = self.engine.force_terminate() {
                error!(error = %e, "Force-terminate failed");
            }
        }
        self.state = SessionState::Uninitialized;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_session();
    }
}
