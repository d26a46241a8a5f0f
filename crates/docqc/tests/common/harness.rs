//! Isolated folders and fast-ticking configs for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use docqc::config::load_config_from_str;
use docqc::conversion::{ConversionQueue, ConversionWorkerConfig};
use docqc::{Config, Database, EventBroadcaster, NoopCheck, PipelineDeps, QcApi, QcStore};

use super::fakes::{EngineLog, ScriptedEngine};

pub struct TestHarness {
    temp_dir: TempDir,
    /// Folder handed to the watcher.
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let watch_dir = temp_dir.path().join("incoming");
        let output_dir = temp_dir.path().join("output");
        std::fs::create_dir_all(&watch_dir).expect("Failed to create watch dir");

        Self {
            temp_dir,
            watch_dir,
            output_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a source document below the watch folder. The content is
    /// unique per path so signatures never collide.
    pub fn write_document(&self, relative: &str) -> PathBuf {
        let path = self.watch_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create document dir");
        }
        std::fs::write(&path, format!("docx body of {}", relative))
            .expect("Failed to write document");
        path
    }

    /// Config with every timer at its minimum and batches cut as soon as
    /// one file is ready.
    pub fn config(&self) -> Config {
        let json = serde_json::json!({
            "version": "1.0",
            "watch_folders": [self.watch_dir.to_string_lossy()],
            "output_directory": self.output_dir.to_string_lossy(),
            "watcher": { "debounce_ms": 100, "poll_interval_secs": 1 },
            "conversion": { "max_conversions_per_session": 50, "escalate_after_failures": 3 },
            "batch": {
                "batch_size": 20,
                "min_batch_size": 1,
                "batch_timeout_seconds": 0,
                "submit_attempts": 1,
                "assemble_interval_secs": 1
            },
            "api": { "endpoint": "http://qc.test/api", "poll_interval_secs": 1 },
            "retry": { "max_retries": 3 }
        });
        load_config_from_str(&json.to_string()).expect("Failed to load test config")
    }

    pub fn deps(&self, engine: ScriptedEngine, api: Arc<dyn QcApi>) -> PipelineDeps {
        PipelineDeps {
            database: Database::open_in_memory().expect("Failed to open database"),
            engine: Box::new(engine),
            api,
            check: Arc::new(NoopCheck),
        }
    }

    /// A store and a running conversion queue without the rest of the
    /// pipeline.
    pub fn conversion_queue(
        &self,
        max_conversions_per_session: u32,
    ) -> (QcStore, ConversionQueue, Arc<Mutex<EngineLog>>) {
        let store = QcStore::new(
            Database::open_in_memory().expect("Failed to open database"),
            EventBroadcaster::new(1024),
        );
        let (engine, log) = ScriptedEngine::new();
        let queue = ConversionQueue::start(
            Box::new(engine),
            store.clone(),
            Arc::new(NoopCheck),
            ConversionWorkerConfig {
                output_directory: self.output_dir.clone(),
                max_conversions_per_session,
                escalate_after_failures: 3,
            },
        )
        .expect("Failed to start conversion queue");
        (store, queue, log)
    }
}

/// Polls `condition` on the current thread until it holds or 15s pass.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

/// Like [`wait_for`], yielding to the runtime between checks.
pub async fn wait_for_async(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
