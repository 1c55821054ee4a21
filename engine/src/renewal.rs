//! Background re-issuing of expiring source URLs.

use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use relay_core::{config::RenewalConfig, WorkItem};
use tokio::task::JoinHandle;

use crate::{cancel::CancelScope, services::UrlResolver};

/// The current source URL of a work item, swapped in place on renewal.
#[derive(Debug, Clone)]
pub struct SharedUrl(Arc<RwLock<String>>);

impl SharedUrl {
	pub fn new(url: impl Into<String>) -> Self {
		Self(Arc::new(RwLock::new(url.into())))
	}

	pub fn get(&self) -> String {
		self.0.read().clone()
	}

	pub fn set(&self, url: String) {
		*self.0.write() = url;
	}
}

/// Handle of a running renewal loop. Dropping it stops the loop.
pub struct RenewalTask {
	handle: JoinHandle<()>,
}

impl Drop for RenewalTask {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// Re-resolve `item`'s URL shortly before it expires, for as long as the
/// returned handle lives and `scope` is not canceled. A failed renewal keeps
/// the old URL and tries again after the minimum interval.
pub fn spawn_renewal(
	resolver: Arc<dyn UrlResolver>,
	item: WorkItem,
	url: SharedUrl,
	ttl: Option<Duration>,
	config: RenewalConfig,
	scope: CancelScope,
) -> RenewalTask {
	let handle = tokio::spawn(async move {
		let default_ttl = Duration::from_millis(config.default_ttl_ms);
		let mut wait = config.interval_for(ttl.unwrap_or(default_ttl));

		loop {
			tokio::select! {
				_ = scope.cancelled() => return,
				_ = tokio::time::sleep(wait) => {}
			}

			match resolver.resolve(&item).await {
				Ok(signed) => {
					let ttl = signed.ttl(chrono::Utc::now()).unwrap_or(default_ttl);
					url.set(signed.url);
					wait = config.interval_for(ttl);
					tracing::debug!(item = %item.label, next_in_ms = wait.as_millis() as u64, "source url renewed");
				}
				Err(err) => {
					wait = Duration::from_millis(config.min_interval_ms);
					tracing::warn!(item = %item.label, error = %err.redacted(), "source url renewal failed");
				}
			}
		}
	});

	RenewalTask { handle }
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use async_trait::async_trait;
	use relay_core::{Locator, TaskError};

	use super::*;
	use crate::services::SignedUrl;

	struct Counter {
		calls: AtomicU32,
		fail_first: bool,
	}

	#[async_trait]
	impl UrlResolver for Counter {
		async fn resolve(&self, _item: &WorkItem) -> Result<SignedUrl, TaskError> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			if self.fail_first && n == 1 {
				return Err(TaskError::transient("api throttled"));
			}
			Ok(SignedUrl {
				url: format!("https://backup/file?sign={n}"),
				expires_at: None,
			})
		}
	}

	fn config() -> RenewalConfig {
		RenewalConfig {
			default_ttl_ms: 10_000,
			safety_margin_ms: 4_000,
			min_interval_ms: 1_000,
		}
	}

	fn item() -> WorkItem {
		WorkItem::new("b1", Locator::Url { url: "https://backup/file?sign=0".into() })
	}

	#[tokio::test(start_paused = true)]
	async fn renews_before_expiry() {
		let resolver = Arc::new(Counter { calls: AtomicU32::new(0), fail_first: false });
		let url = SharedUrl::new("https://backup/file?sign=0");
		let _task = spawn_renewal(
			resolver.clone(),
			item(),
			url.clone(),
			Some(Duration::from_secs(10)),
			config(),
			CancelScope::new(),
		);

		tokio::time::sleep(Duration::from_millis(5_900)).await;
		assert_eq!(url.get(), "https://backup/file?sign=0");

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(url.get(), "https://backup/file?sign=1");

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_renewal_keeps_url_and_retries() {
		let resolver = Arc::new(Counter { calls: AtomicU32::new(0), fail_first: true });
		let url = SharedUrl::new("https://backup/file?sign=0");
		let _task = spawn_renewal(resolver.clone(), item(), url.clone(), Some(Duration::from_secs(5)), config(), CancelScope::new());

		tokio::time::sleep(Duration::from_millis(1_100)).await;
		assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
		assert_eq!(url.get(), "https://backup/file?sign=0");

		tokio::time::sleep(Duration::from_millis(1_000)).await;
		assert_eq!(url.get(), "https://backup/file?sign=2");
	}

	#[tokio::test(start_paused = true)]
	async fn stops_when_scope_is_canceled() {
		let resolver = Arc::new(Counter { calls: AtomicU32::new(0), fail_first: false });
		let scope = CancelScope::new();
		let _task = spawn_renewal(resolver.clone(), item(), SharedUrl::new("u"), None, config(), scope.clone());

		scope.cancel(TaskError::canceled("done"));
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn dropping_the_handle_stops_renewals() {
		let resolver = Arc::new(Counter { calls: AtomicU32::new(0), fail_first: false });
		let task = spawn_renewal(resolver.clone(), item(), SharedUrl::new("u"), None, config(), CancelScope::new());

		drop(task);
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
	}
}
