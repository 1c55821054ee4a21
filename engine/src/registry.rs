//! Table of in-flight sub-tasks that must hear about cancellation.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use relay_core::TaskError;
use ulid::Ulid;

pub type TaskId = Ulid;

/// A live sub-task that can be told to stop.
pub trait Cancelable: Send + Sync {
	fn cancel(&self, reason: &TaskError) -> Result<(), TaskError>;
}

/// Every entry is an executing sub-task. Entries leave on completion (guard
/// drop) or when [`RunningTaskRegistry::cancel_all`] drains them.
#[derive(Default)]
pub struct RunningTaskRegistry {
	entries: Mutex<HashMap<TaskId, Arc<dyn Cancelable>>>,
}

impl RunningTaskRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert synchronously; the returned guard removes the entry when dropped.
	pub fn register(self: &Arc<Self>, handle: Arc<dyn Cancelable>) -> RegistryGuard {
		let id = Ulid::new();
		self.entries.lock().insert(id, handle);
		RegistryGuard {
			id,
			registry: Arc::clone(self),
		}
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	pub fn contains(&self, id: &TaskId) -> bool {
		self.entries.lock().contains_key(id)
	}

	fn remove(&self, id: &TaskId) {
		self.entries.lock().remove(id);
	}

	/// Signal every registered sub-task and empty the table. Never fails;
	/// errors raised by individual handles are logged and dropped.
	pub fn cancel_all(&self, reason: &TaskError) -> usize {
		let drained: Vec<(TaskId, Arc<dyn Cancelable>)> = self.entries.lock().drain().collect();
		let count = drained.len();

		for (id, handle) in drained {
			if let Err(err) = handle.cancel(reason) {
				tracing::warn!(task_id = %id, error = %err.redacted(), "sub-task cancellation failed");
			}
		}

		count
	}
}

pub struct RegistryGuard {
	id: TaskId,
	registry: Arc<RunningTaskRegistry>,
}

impl RegistryGuard {
	pub fn id(&self) -> TaskId {
		self.id
	}
}

impl Drop for RegistryGuard {
	fn drop(&mut self) {
		self.registry.remove(&self.id);
	}
}
