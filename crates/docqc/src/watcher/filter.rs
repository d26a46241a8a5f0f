use std::path::{Path, PathBuf};

use glob::Pattern;
use log::debug;

use crate::config::WatcherConfig;
use crate::error::ConfigError;

/// Decides which files in a watch folder are documents to ingest.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    extensions: Vec<String>,
    exclude_patterns: Vec<Pattern>,
    ignored_roots: Vec<PathBuf>,
}

impl DocumentFilter {
    /// Files below `output_directory` are never ingested, even when it lies
    /// inside a watch folder.
    pub fn new(config: &WatcherConfig, output_directory: Option<&Path>) -> Result<Self, ConfigError> {
        let exclude_patterns = config
            .exclude
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_patterns,
            ignored_roots: output_directory.map(Path::to_path_buf).into_iter().collect(),
        })
    }

    pub fn accepts(&self, path: &Path) -> bool {
        if self.ignored_roots.iter().any(|root| path.starts_with(root)) {
            return false;
        }

        let filename = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return false,
        };

        if let Some(pattern) = self.exclude_patterns.iter().find(|p| p.matches(filename)) {
            debug!("File '{}' excluded by pattern '{}'", filename, pattern);
            return false;
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.contains(&ext.to_lowercase()),
            None => false,
        }
    }
}
