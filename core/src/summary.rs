use std::fmt;

use serde::Serialize;

use crate::models::TaskResult;

/// Maximum number of per-item detail blocks in a summary.
pub const DETAIL_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
	Success,
	Fail,
}

impl fmt::Display for RunStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RunStatus::Success => f.write_str("success"),
			RunStatus::Fail => f.write_str("fail"),
		}
	}
}

/// Final report of one run, shaped for a single log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogSummary {
	pub name: String,
	pub status: RunStatus,
	pub success: usize,
	pub total: usize,
	pub details: Vec<String>,
}

impl LogSummary {
	/// When the result list is truncated and contains failures, success
	/// details are dropped so the failures are what gets shown.
	pub fn from_results(name: &str, results: &[TaskResult]) -> Self {
		let truncated = results.len() > DETAIL_LIMIT;
		let has_error = results.iter().any(|r| !r.is_success());

		let mut details = Vec::new();
		let mut success = 0;

		for result in results {
			let params = serde_json::to_string(&result.params).unwrap_or_default();
			match &result.outcome {
				Err(err) => {
					if details.len() < DETAIL_LIMIT {
						let error = serde_json::to_string(err).unwrap_or_else(|_| err.to_string());
						details.push(format!("TaskStatus: fail\nParams: {params}\nError: {err}\nDetail: {error}"));
					}
				}
				Ok(outcome) => {
					if details.len() < DETAIL_LIMIT && !(truncated && has_error) {
						details.push(format!("TaskStatus: success\nParams: {params}\nResult: {}", outcome.to_json()));
					}
					success += 1;
				}
			}
		}

		let total = results.len();
		Self {
			name: name.to_string(),
			status: if success < total {
				RunStatus::Fail
			} else {
				RunStatus::Success
			},
			success,
			total,
			details,
		}
	}

	pub fn is_success(&self) -> bool {
		self.status == RunStatus::Success
	}
}

impl fmt::Display for LogSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"Result: {} {}\nsuccess: {}\ntotal: {}",
			self.name, self.status, self.success, self.total
		)?;
		for detail in &self.details {
			write!(f, "\n\n{detail}")?;
		}
		Ok(())
	}
}
