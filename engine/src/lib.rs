//! Verified-copy engine: retry, cancellation, checksum verification, streaming
//! transfer and the bounded-concurrency orchestrator driving the backup jobs.

pub mod cancel;
pub mod checksum;
pub mod copier;
pub mod local;
pub mod orchestrator;
pub mod registry;
pub mod renewal;
pub mod retry;
pub mod services;
pub mod tasks;
pub mod timeout;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

pub use cancel::CancelScope;
pub use checksum::{probe_meta, CheckRequest, ChecksumVerifier};
pub use orchestrator::{BackupJob, BackupOrchestrator, CancelHandle, JobContext};
pub use registry::RunningTaskRegistry;
pub use retry::RetryExecutor;
pub use timeout::TimeoutWatcher;
pub use transfer::{TransferRequest, TransferTask};
