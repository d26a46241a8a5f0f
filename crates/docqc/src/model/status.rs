//! Record and batch lifecycles with their explicit transition tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a transition is being requested.
///
/// Retry edges are the only way out of a terminal state, and only the retry
/// coordinator asks for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Normal pipeline progress.
    Forward,
    /// Rollback of an un-accepted batch submission.
    Revert,
    /// Explicit user or coordinator retry.
    Retry,
}

/// Per-file QC status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    Queued,
    Converting,
    Converted,
    ConversionFailed,
    Submitting,
    Processing,
    Downloading,
    Completed,
    Failed,
    NumberingFailed,
}

impl QcStatus {
    pub const ALL: [QcStatus; 10] = [
        QcStatus::Queued,
        QcStatus::Converting,
        QcStatus::Converted,
        QcStatus::ConversionFailed,
        QcStatus::Submitting,
        QcStatus::Processing,
        QcStatus::Downloading,
        QcStatus::Completed,
        QcStatus::Failed,
        QcStatus::NumberingFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QcStatus::Queued => "queued",
            QcStatus::Converting => "converting",
            QcStatus::Converted => "converted",
            QcStatus::ConversionFailed => "conversion_failed",
            QcStatus::Submitting => "submitting",
            QcStatus::Processing => "processing",
            QcStatus::Downloading => "downloading",
            QcStatus::Completed => "completed",
            QcStatus::Failed => "failed",
            QcStatus::NumberingFailed => "numbering_failed",
        }
    }

    /// States a record only leaves through a retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QcStatus::Completed
                | QcStatus::Failed
                | QcStatus::NumberingFailed
                | QcStatus::ConversionFailed
        )
    }

    /// States in which a record is owned by a submitted batch.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            QcStatus::Submitting | QcStatus::Processing | QcStatus::Downloading
        )
    }

    /// Terminal failure states counted against a batch.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            QcStatus::Failed | QcStatus::NumberingFailed | QcStatus::ConversionFailed
        )
    }

    /// Whether `self -> to` is an edge of the record state machine for the
    /// given transition kind.
    pub fn can_transition(self, to: QcStatus, kind: TransitionKind) -> bool {
        use QcStatus::*;

        match kind {
            TransitionKind::Forward => matches!(
                (self, to),
                (Queued, Converting)
                    | (Converting, Converted)
                    | (Converting, ConversionFailed)
                    | (Converted, Submitting)
                    | (Converted, ConversionFailed)
                    | (Converted, NumberingFailed)
                    | (Submitting, Processing)
                    | (Processing, Downloading)
                    | (Processing, Failed)
                    | (Processing, NumberingFailed)
                    | (Downloading, Completed)
                    | (Downloading, Failed)
            ),
            TransitionKind::Revert => matches!((self, to), (Submitting, Converted)),
            TransitionKind::Retry => matches!(
                (self, to),
                (ConversionFailed, Queued)
                    | (NumberingFailed, Queued)
                    | (Failed, Queued)
                    | (NumberingFailed, Converted)
                    | (Failed, Converted)
            ),
        }
    }
}

impl fmt::Display for QcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QcStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QcStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown QC status '{}'", s))
    }
}

/// Submission batch status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Submitted,
    Processing,
    PartialComplete,
    Completed,
    Failed,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 6] = [
        BatchStatus::Pending,
        BatchStatus::Submitted,
        BatchStatus::Processing,
        BatchStatus::PartialComplete,
        BatchStatus::Completed,
        BatchStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Submitted => "submitted",
            BatchStatus::Processing => "processing",
            BatchStatus::PartialComplete => "partial_complete",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::PartialComplete | BatchStatus::Completed | BatchStatus::Failed
        )
    }

    /// Batches the poller still has to ask the remote service about.
    pub fn is_pollable(self) -> bool {
        matches!(self, BatchStatus::Submitted | BatchStatus::Processing)
    }

    pub fn can_transition(self, to: BatchStatus) -> bool {
        use BatchStatus::*;

        matches!(
            (self, to),
            (Pending, Submitted)
                | (Submitted, Processing)
                | (Processing, PartialComplete)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown batch status '{}'", s))
    }
}
