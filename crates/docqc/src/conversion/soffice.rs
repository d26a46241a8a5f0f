//! Headless office-suite engine driven as a subprocess.
//!
//! The session is a dedicated user profile directory: every conversion runs
//! `soffice --headless --convert-to pdf` against that profile, so a crashed
//! or hung instance can be identified and killed by name without touching a
//! desktop instance of the suite.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::{debug, info_span, warn};

use super::{ConversionEngine, DocumentHandle};
use crate::error::ConversionError;
use crate::sanitize::redact_path;

pub struct SofficeEngine {
    binary: PathBuf,
    process_name: String,
    profile_dir: PathBuf,
    initialized: bool,
    next_doc: u64,
}

impl SofficeEngine {
    /// `profile_dir` is created on `initialize` and owned by this engine.
    pub fn new(binary: PathBuf, process_name: String, profile_dir: PathBuf) -> Self {
        Self {
            binary,
            process_name,
            profile_dir,
            initialized: false,
            next_doc: 0,
        }
    }

    fn profile_url(&self) -> String {
        let path = self.profile_dir.to_string_lossy().replace('\\', "/");
        if path.starts_with('/') {
            format!("file://{}", path)
        } else {
            format!("file:///{}", path)
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("-env:UserInstallation={}", self.profile_url()))
            .args(["--headless", "--invisible", "--nologo", "--norestore", "--nodefault"])
            .stdin(Stdio::null());
        cmd
    }

    fn staging_dir(&self, doc: &DocumentHandle) -> PathBuf {
        self.profile_dir.join(format!("out-{}", doc.id))
    }
}

fn format_output(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    match output.status.code() {
        Some(code) => format!("exit code {}: {}", code, text),
        None => format!("terminated by signal: {}", text),
    }
}

impl ConversionEngine for SofficeEngine {
    fn name(&self) -> &str {
        "soffice"
    }

    fn initialize(&mut self) -> Result<(), ConversionError> {
        fs::create_dir_all(&self.profile_dir).map_err(|e| {
            ConversionError::SessionInit(format!(
                "cannot create profile {}: {}",
                self.profile_dir.display(),
                e
            ))
        })?;

        let output = self
            .base_command()
            .arg("--version")
            .output()
            .map_err(|e| {
                ConversionError::SessionInit(format!("{}: {}", self.binary.display(), e))
            })?;
        if !output.status.success() {
            return Err(ConversionError::SessionInit(format_output(&output)));
        }

        debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "soffice available"
        );
        self.initialized = true;
        Ok(())
    }

    fn open(&mut self, source: &Path) -> Result<DocumentHandle, ConversionError> {
        if !self.initialized {
            return Err(ConversionError::SessionDead("session not initialized".to_string()));
        }
        // Read access is all the engine needs; it never writes the source.
        fs::File::open(source).map_err(|e| ConversionError::Open {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.next_doc += 1;
        Ok(DocumentHandle {
            id: self.next_doc,
            source: source.to_path_buf(),
        })
    }

    fn export(&mut self, doc: &DocumentHandle, dest: &Path) -> Result<(), ConversionError> {
        let _span = info_span!("soffice.export", file = %redact_path(&doc.source)).entered();

        let staging = self.staging_dir(doc);
        fs::create_dir_all(&staging).map_err(|e| ConversionError::Export {
            path: doc.source.clone(),
            reason: format!("cannot create staging dir: {}", e),
        })?;

        let output = self
            .base_command()
            .args(["--convert-to", "pdf", "--outdir"])
            .arg(&staging)
            .arg(&doc.source)
            .output()
            .map_err(|e| ConversionError::SessionDead(e.to_string()))?;

        if output.status.code().is_none() {
            return Err(ConversionError::SessionDead(format_output(&output)));
        }
        if !output.status.success() {
            return Err(ConversionError::Export {
                path: doc.source.clone(),
                reason: format_output(&output),
            });
        }

        let stem = doc
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        let produced = staging.join(format!("{}.pdf", stem));
        if !produced.is_file() {
            // soffice exits 0 even when the filter could not load the source.
            return Err(ConversionError::Export {
                path: doc.source.clone(),
                reason: format!("no output produced ({})", format_output(&output)),
            });
        }

        fs::rename(&produced, dest)
            .or_else(|_| fs::copy(&produced, dest).map(|_| ()))
            .map_err(|e| ConversionError::Export {
                path: doc.source.clone(),
                reason: format!("cannot move rendition to {}: {}", dest.display(), e),
            })
    }

    fn close(&mut self, doc: DocumentHandle) -> Result<(), ConversionError> {
        let staging = self.staging_dir(&doc);
        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!(error = %e, "Failed to remove staging directory");
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ConversionError> {
        self.initialized = false;
        // A stale lock file makes the next start think the profile is in use.
        let lock = self.profile_dir.join(".lock");
        if lock.exists() {
            fs::remove_file(&lock).map_err(|e| ConversionError::Shutdown(e.to_string()))?;
        }
        Ok(())
    }

    fn force_terminate(&mut self) -> Result<(), ConversionError> {
        self.initialized = false;

        let output = if cfg!(windows) {
            Command::new("taskkill")
                .args(["/F", "/IM", &self.process_name])
                .output()
        } else {
            Command::new("pkill")
                .args(["-f", &self.process_name])
                .output()
        }
        .map_err(|e| ConversionError::Shutdown(e.to_string()))?;

        // pkill exits 1 when nothing matched, which is fine here.
        match output.status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(ConversionError::Shutdown(format_output(&output))),
        }
    }
}
