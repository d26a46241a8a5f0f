//! Push notifications for the UI shell.
//!
//! Every pipeline stage publishes onto one tagged-event broadcast channel;
//! the shell (or any other consumer) subscribes and filters by variant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{BatchStatus, QcStatus};

/// An event emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A new document was detected and recorded.
    FileDetected {
        qc_id: String,
        path: String,
        timestamp: DateTime<Utc>,
    },
    /// A record changed status.
    StatusUpdate {
        qc_id: String,
        status: QcStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The number of pending conversion jobs changed.
    QueueUpdate { length: usize },
    /// A batch changed status or counters.
    BatchUpdate {
        batch_id: String,
        status: BatchStatus,
        completed: u32,
        failed: u32,
        processing: u32,
    },
    /// A user-visible error.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn file_detected(qc_id: &str, path: &str) -> Self {
        PipelineEvent::FileDetected {
            qc_id: qc_id.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn status_update(qc_id: &str, status: QcStatus, error: Option<&str>) -> Self {
        PipelineEvent::StatusUpdate {
            qc_id: qc_id.to_string(),
            status,
            error: error.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PipelineEvent::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcasts pipeline events to all subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: PipelineEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(PipelineEvent::error(message));
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
