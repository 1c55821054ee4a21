use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::models::{redact_text, ObjectMeta};

/// Trace identifier attached to every checksum mismatch, so the failure can be
/// found in aggregated logs regardless of which job produced it.
pub const CHECKSUM_TRACE_ID: &str = "relay.checksum.check_file_same";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
	Transient,
	ChecksumMismatch,
	Canceled,
	EnumerationFailed,
	NotFound,
	RangeNotSatisfiable,
	InvalidConfig,
	Internal,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::Transient => "transient",
			ErrorKind::ChecksumMismatch => "checksum-mismatch",
			ErrorKind::Canceled => "canceled",
			ErrorKind::EnumerationFailed => "enumeration-failed",
			ErrorKind::NotFound => "not-found",
			ErrorKind::RangeNotSatisfiable => "range-not-satisfiable",
			ErrorKind::InvalidConfig => "invalid-config",
			ErrorKind::Internal => "internal",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Both sides of a failed content comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecksumMismatch {
	pub trace_id: &'static str,
	pub source_url: String,
	pub target_url: String,
	pub source_meta: ObjectMeta,
	pub target_meta: ObjectMeta,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum TaskError {
	#[error("transient error: {0}")]
	Transient(String),

	#[error("checksum mismatch: source={} target={}", .0.source_url, .0.target_url)]
	ChecksumMismatch(Box<ChecksumMismatch>),

	#[error("task canceled: {0}")]
	Canceled(String),

	#[error("{action} failed for {scope}: {message}")]
	EnumerationFailed {
		scope: String,
		action: String,
		message: String,
	},

	#[error("not found: {0}")]
	NotFound(String),

	#[error("range not satisfiable: {0}")]
	RangeNotSatisfiable(String),

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl TaskError {
	pub fn transient(message: impl fmt::Display) -> Self {
		TaskError::Transient(message.to_string())
	}

	pub fn canceled(reason: impl fmt::Display) -> Self {
		TaskError::Canceled(reason.to_string())
	}

	pub fn enumeration(scope: impl Into<String>, action: impl Into<String>, cause: &TaskError) -> Self {
		TaskError::EnumerationFailed {
			scope: scope.into(),
			action: action.into(),
			message: cause.to_string(),
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			TaskError::Transient(_) => ErrorKind::Transient,
			TaskError::ChecksumMismatch(_) => ErrorKind::ChecksumMismatch,
			TaskError::Canceled(_) => ErrorKind::Canceled,
			TaskError::EnumerationFailed { .. } => ErrorKind::EnumerationFailed,
			TaskError::NotFound(_) => ErrorKind::NotFound,
			TaskError::RangeNotSatisfiable(_) => ErrorKind::RangeNotSatisfiable,
			TaskError::InvalidConfig(_) => ErrorKind::InvalidConfig,
			TaskError::Internal(_) => ErrorKind::Internal,
		}
	}

	/// Whether this error is worth another attempt. Checksum mismatches signal
	/// corruption and cancellations are final, so only transient failures qualify.
	pub fn is_retryable(&self) -> bool {
		matches!(self, TaskError::Transient(_))
	}

	pub fn is_canceled(&self) -> bool {
		matches!(self, TaskError::Canceled(_))
	}

	/// Strip signed-URL querystrings from every message this error carries.
	pub fn redacted(self) -> Self {
		match self {
			TaskError::Transient(m) => TaskError::Transient(redact_text(&m)),
			TaskError::Canceled(m) => TaskError::Canceled(redact_text(&m)),
			TaskError::NotFound(m) => TaskError::NotFound(redact_text(&m)),
			TaskError::RangeNotSatisfiable(m) => TaskError::RangeNotSatisfiable(redact_text(&m)),
			TaskError::InvalidConfig(m) => TaskError::InvalidConfig(redact_text(&m)),
			TaskError::Internal(m) => TaskError::Internal(redact_text(&m)),
			TaskError::EnumerationFailed { scope, action, message } => TaskError::EnumerationFailed {
				scope,
				action,
				message: redact_text(&message),
			},
			TaskError::ChecksumMismatch(mut detail) => {
				detail.source_url = redact_text(&detail.source_url);
				detail.target_url = redact_text(&detail.target_url);
				TaskError::ChecksumMismatch(detail)
			}
		}
	}
}
