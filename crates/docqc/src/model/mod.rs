//! Domain types shared by every pipeline stage.

pub mod batch;
pub mod record;
pub mod status;

pub use batch::{BatchManifest, ManifestEntry, QcBatch};
pub use record::{file_signature, DocumentRole, IssueCounts, QcRecord};
pub use status::{BatchStatus, QcStatus, TransitionKind};
