//! Batching, submission, status polling and retries.

pub mod archive;
pub mod assembler;
pub mod poller;
pub mod retry;

pub use assembler::{plan_batch, BatchAssembler, BatchPlan, Candidate, Trigger};
pub use poller::{BatchPoller, PollSummary};
pub use retry::RetryCoordinator;
