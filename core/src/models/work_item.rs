use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Locator;

/// One enumerated artifact to copy or verify. Produced by a job's enumeration,
/// consumed once by the orchestrator, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
	/// Short name of the artifact (log file name, backup id, object key).
	pub label: String,
	pub locator: Locator,
	/// Inputs for the target key template, e.g. `Domain`, `InstanceId`.
	#[serde(default)]
	pub template_vars: BTreeMap<String, String>,
	#[serde(default)]
	pub content_length: Option<u64>,
	#[serde(default)]
	pub crc64: Option<String>,
	/// Expiry of a signed source URL, when the listing reported one.
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
}

impl WorkItem {
	pub fn new(label: impl Into<String>, locator: Locator) -> Self {
		Self {
			label: label.into(),
			locator,
			template_vars: BTreeMap::new(),
			content_length: None,
			crc64: None,
			expires_at: None,
		}
	}

	pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.template_vars.insert(name.into(), value.into());
		self
	}

	pub fn with_content_length(mut self, len: u64) -> Self {
		self.content_length = Some(len);
		self
	}

	pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	pub fn var(&self, name: &str) -> Option<&str> {
		self.template_vars.get(name).map(String::as_str)
	}
}
