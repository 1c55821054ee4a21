use serde::{Deserialize, Serialize};

/// Lifecycle of one orchestrator instance. `Canceled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
	Waiting,
	Running,
	Completed,
	Canceled,
}

impl OrchestratorState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrchestratorState::Completed | OrchestratorState::Canceled)
	}
}
