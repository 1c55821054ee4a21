use std::{future::Future, time::Duration};

use relay_core::{config::RetryConfig, TaskError};

use crate::cancel::CancelScope;

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryExecutor {
	max_attempts: u32,
	delay: Duration,
}

impl Default for RetryExecutor {
	fn default() -> Self {
		Self::from_config(&RetryConfig::default())
	}
}

impl RetryExecutor {
	pub fn new(max_attempts: u32, delay: Duration) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
			delay,
		}
	}

	pub fn from_config(config: &RetryConfig) -> Self {
		Self::new(config.max_attempts, config.delay())
	}

	pub fn max_attempts(&self) -> u32 {
		self.max_attempts
	}

	/// Run `op` until it succeeds, fails with a non-retryable error, or the
	/// attempt budget is spent; the last error is returned unchanged.
	///
	/// The scope is checked before every attempt and while sleeping, so a
	/// canceled owner stops the loop with its cancel error instead of calling
	/// `op` again.
	pub async fn run<T, F, Fut>(&self, scope: Option<&CancelScope>, label: &str, mut op: F) -> Result<T, TaskError>
	where
		F: FnMut(u32) -> Fut,
		Fut: Future<Output = Result<T, TaskError>>,
	{
		let mut attempt = 0;
		loop {
			if let Some(scope) = scope {
				scope.check()?;
			}
			attempt += 1;

			let err = match op(attempt).await {
				Ok(value) => return Ok(value),
				Err(err) => err,
			};

			if !err.is_retryable() || attempt >= self.max_attempts {
				return Err(err);
			}

			tracing::warn!(
				op = label,
				attempt,
				max_attempts = self.max_attempts,
				error = %err.clone().redacted(),
				"attempt failed, retrying"
			);

			match scope {
				Some(scope) => {
					tokio::select! {
						_ = scope.cancelled() => return Err(scope.error()),
						_ = tokio::time::sleep(self.delay) => {}
					}
				}
				None => tokio::time::sleep(self.delay).await,
			}
		}
	}
}
