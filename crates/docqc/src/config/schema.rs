use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::secrets::expand_home;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Folders watched on startup.
    #[serde(default)]
    pub watch_folders: Vec<String>,
    /// Renditions, archives and reports are written below this directory.
    pub output_directory: String,
    /// SQLite file; defaults to `~/.docqc/data/docqc.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.output_directory))
    }

    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        self.watch_folders
            .iter()
            .map(|f| PathBuf::from(expand_home(f)))
            .collect()
    }

    pub fn database_file(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(expand_home(path))),
            None => crate::db::default_database_path(),
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output_dir().join("reports")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.output_dir().join("batches")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Accepted source extensions, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// File name globs that are never ingested.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_watch_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_extensions() -> Vec<String> {
    ["docx", "doc", "odt", "rtf"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_exclude() -> Vec<String> {
    vec!["~$*".to_string(), ".~lock*".to_string()]
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_watch_poll_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude: default_exclude(),
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_watch_poll_secs(),
            recursive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_engine_binary")]
    pub engine_binary: String,
    /// Process name used to force-terminate a hung engine.
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_max_conversions")]
    pub max_conversions_per_session: u32,
    #[serde(default = "default_escalate_after")]
    pub escalate_after_failures: u32,
}

fn default_engine_binary() -> String {
    if cfg!(windows) {
        "soffice.exe".to_string()
    } else {
        "soffice".to_string()
    }
}

fn default_process_name() -> String {
    if cfg!(windows) {
        "soffice.bin".to_string()
    } else {
        "soffice".to_string()
    }
}

fn default_max_conversions() -> u32 {
    50
}

fn default_escalate_after() -> u32 {
    3
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            engine_binary: default_engine_binary(),
            process_name: default_process_name(),
            max_conversions_per_session: default_max_conversions(),
            escalate_after_failures: default_escalate_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size_mb")]
    pub max_batch_size_mb: u64,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_seconds: u64,
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,
    #[serde(default = "default_assemble_interval")]
    pub assemble_interval_secs: u64,
}

fn default_batch_size() -> usize {
    20
}

fn default_min_batch_size() -> usize {
    5
}

fn default_max_batch_size_mb() -> u64 {
    100
}

fn default_batch_timeout() -> u64 {
    300
}

fn default_submit_attempts() -> u32 {
    3
}

fn default_assemble_interval() -> u64 {
    10
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size_mb: default_max_batch_size_mb(),
            batch_timeout_seconds: default_batch_timeout(),
            submit_attempts: default_submit_attempts(),
            assemble_interval_secs: default_assemble_interval(),
        }
    }
}

impl BatchConfig {
    pub fn max_batch_bytes(&self) -> u64 {
        self.max_batch_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// API key given inline. Prefer `api_key_file` or `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8000/api/qc".to_string()
}

fn default_api_poll_secs() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            api_key_file: None,
            api_key_env: None,
            poll_interval_secs: default_api_poll_secs(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = serde_json::from_str(
            r#"{ "version": "1.0", "output_directory": "/out" }"#,
        )
        .unwrap();
        assert!(config.watch_folders.is_empty());
        assert_eq!(config.watcher.extensions, vec!["docx", "doc", "odt", "rtf"]);
        assert_eq!(config.watcher.debounce_ms, 500);
        assert_eq!(config.conversion.max_conversions_per_session, 50);
        assert_eq!(config.batch.submit_attempts, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_derived_directories() {
        let config: Config = serde_json::from_str(
            r#"{ "version": "1.0", "output_directory": "/out", "database_path": "/data/qc.db" }"#,
        )
        .unwrap();
        assert_eq!(config.reports_dir(), PathBuf::from("/out/reports"));
        assert_eq!(config.archives_dir(), PathBuf::from("/out/batches"));
        assert_eq!(config.database_file(), Some(PathBuf::from("/data/qc.db")));
    }

    #[test]
    fn test_max_batch_bytes() {
        let batch = BatchConfig {
            max_batch_size_mb: 2,
            ..Default::default()
        };
        assert_eq!(batch.max_batch_bytes(), 2 * 1024 * 1024);
    }
}
