pub mod batch;
pub mod config;
pub mod conversion;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod sanitize;
pub mod secrets;
pub mod service;
pub mod store;
pub mod watcher;

pub use batch::{BatchAssembler, BatchPoller, RetryCoordinator};
pub use config::{load_config, Config};
pub use conversion::{ConversionEngine, DocumentHandle, NoopCheck, SofficeEngine, StructureCheck};
pub use db::Database;
pub use error::{
    BatchError, ConfigError, ConversionError, DocQcError, Result, StoreError, WatchError,
};
pub use events::{EventBroadcaster, PipelineEvent};
pub use logging::init_logging;
pub use model::{BatchManifest, BatchStatus, IssueCounts, QcBatch, QcRecord, QcStatus};
pub use pipeline::{Pipeline, PipelineDeps};
pub use remote::{HttpQcApi, QcApi, RemoteError};
pub use service::QcService;
pub use store::QcStore;
pub use watcher::{FolderWatcher, WatcherStatus};
