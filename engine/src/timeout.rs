use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::Mutex;
use relay_core::{config::TimeoutConfig, TaskError};
use tokio::{task::JoinHandle, time::Instant};

/// One-shot deadline monitor for the host's execution budget.
///
/// Fires `trigger(error)` once, `safety_margin` before the time limit, so the
/// caller can cancel in-flight work and still log partial results.
pub struct TimeoutWatcher {
	deadline: Instant,
	fired: Arc<AtomicBool>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutWatcher {
	/// Must be called from within a tokio runtime.
	pub fn start<F>(config: &TimeoutConfig, error: TaskError, trigger: F) -> Self
	where
		F: FnOnce(TaskError) + Send + 'static,
	{
		let after = config.trigger_after();
		let deadline = Instant::now() + after;
		let fired = Arc::new(AtomicBool::new(false));

		let handle = tokio::spawn({
			let fired = fired.clone();
			async move {
				tokio::time::sleep_until(deadline).await;
				if !fired.swap(true, Ordering::SeqCst) {
					tracing::warn!(error = %error.clone().redacted(), "execution time limit approaching, triggering cancellation");
					trigger(error);
				}
			}
		});

		tracing::debug!(trigger_after_ms = after.as_millis() as u64, "timeout watcher armed");

		Self {
			deadline,
			fired,
			handle: Mutex::new(Some(handle)),
		}
	}

	/// True once the trigger instant has passed.
	pub fn is_timeout(&self) -> bool {
		self.fired.load(Ordering::SeqCst) || Instant::now() >= self.deadline
	}

	pub fn remaining(&self) -> Duration {
		self.deadline.saturating_duration_since(Instant::now())
	}

	/// Disarm the pending timer. Idempotent, and safe after the timer fired.
	pub fn clear(&self) {
		if let Some(handle) = self.handle.lock().take() {
			handle.abort();
		}
	}
}

impl Drop for TimeoutWatcher {
	fn drop(&mut self) {
		self.clear();
	}
}
