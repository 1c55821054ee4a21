//! Data model, error taxonomy and configuration shared by the relay engine and CLI.

pub mod config;
pub mod error;
pub mod models;
pub mod summary;
pub mod template;

pub use error::{ChecksumMismatch, ErrorKind, TaskError, CHECKSUM_TRACE_ID};
pub use models::{is_signed_url, redact_url, Locator, ObjectMeta, ObjectRef, OrchestratorState, TaskOutcome, TaskParams, TaskResult, WorkItem};
pub use summary::{LogSummary, RunStatus};
pub use template::render_key_template;
