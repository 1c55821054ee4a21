use std::path::Path;

use anyhow::{Context, Result};
use relay_core::config::TimeWindow;
use serde::Deserialize;

/// Execution context handed over by the invoking platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvocationContext {
	/// Remaining execution budget.
	pub time_limit_in_ms: Option<u64>,
	pub request_id: Option<String>,
}

/// Invocation payload. Every field is optional; present ones override settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	#[serde(default)]
	pub context: InvocationContext,
	pub back_track_days: Option<u32>,
	pub time_range: Option<TimeWindow>,
	pub domains: Option<Vec<String>>,
	pub instances: Option<Vec<String>>,
}

impl Event {
	pub fn load(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).with_context(|| format!("reading event {}", path.display()))?;
		serde_json::from_str(&raw).with_context(|| format!("parsing event {}", path.display()))
	}
}
