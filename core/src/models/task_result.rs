use std::{collections::BTreeMap, fmt};

use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::error::TaskError;

/// Redacted description of the item a result belongs to.
pub type TaskParams = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
	Completed(serde_json::Value),
	/// Source and target already hold identical content.
	SameFileSkip,
	/// The source was produced by this pipeline.
	LoopRiskSkip,
}

impl TaskOutcome {
	pub fn to_json(&self) -> serde_json::Value {
		match self {
			TaskOutcome::Completed(value) => value.clone(),
			other => serde_json::Value::String(other.to_string()),
		}
	}

	pub fn is_skip(&self) -> bool {
		!matches!(self, TaskOutcome::Completed(_))
	}
}

impl fmt::Display for TaskOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TaskOutcome::Completed(value) => write!(f, "{value}"),
			TaskOutcome::SameFileSkip => f.write_str("same file skip"),
			TaskOutcome::LoopRiskSkip => f.write_str("loop risk skip"),
		}
	}
}

impl Serialize for TaskOutcome {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.to_json().serialize(serializer)
	}
}

/// Outcome of one work item. Exactly one of result/error exists, which the
/// `Result` encodes directly.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
	pub params: TaskParams,
	pub outcome: Result<TaskOutcome, TaskError>,
}

impl TaskResult {
	pub fn new(params: TaskParams, outcome: Result<TaskOutcome, TaskError>) -> Self {
		Self {
			params,
			outcome: outcome.map_err(TaskError::redacted),
		}
	}

	pub fn result(&self) -> Option<&TaskOutcome> {
		self.outcome.as_ref().ok()
	}

	pub fn error(&self) -> Option<&TaskError> {
		self.outcome.as_ref().err()
	}

	pub fn is_success(&self) -> bool {
		self.outcome.is_ok()
	}
}

impl Serialize for TaskResult {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut state = serializer.serialize_struct("TaskResult", 3)?;
		state.serialize_field("params", &self.params)?;
		state.serialize_field("result", &self.result())?;
		state.serialize_field("error", &self.error())?;
		state.end()
	}
}
