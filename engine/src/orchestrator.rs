//! Enumerate, fan out with bounded concurrency, aggregate in order.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{
	config::OrchestratorConfig, OrchestratorState, TaskError, TaskOutcome, TaskParams, TaskResult, WorkItem,
};
use tokio::sync::Semaphore;

use crate::{
	cancel::CancelScope,
	registry::RunningTaskRegistry,
	retry::RetryExecutor,
	services::ListPage,
};

/// Everything a job needs while enumerating or processing one item.
#[derive(Clone)]
pub struct JobContext {
	/// The run's scope during enumeration, the item's own scope while processing.
	pub scope: CancelScope,
	pub registry: Arc<RunningTaskRegistry>,
	pub retry: RetryExecutor,
	pub config: Arc<OrchestratorConfig>,
}

/// One backup domain: where the work comes from and what to do per item.
#[async_trait]
pub trait BackupJob: Send + Sync + 'static {
	fn name(&self) -> &str;

	/// The full work list. An error aborts the run.
	async fn enumerate(&self, ctx: &JobContext) -> Result<Vec<WorkItem>, TaskError>;

	/// Redacted parameters recorded with the item's result.
	fn describe(&self, item: &WorkItem) -> TaskParams {
		TaskParams::from([
			("label".to_string(), item.label.clone()),
			("sourceUrl".to_string(), item.locator.redacted()),
		])
	}

	async fn process(&self, item: WorkItem, ctx: &JobContext) -> Result<TaskOutcome, TaskError>;
}

struct StateCell {
	state: OrchestratorState,
	cancel_error: Option<TaskError>,
}

/// Cloneable cancellation entry point, handed to the timeout watcher.
#[derive(Clone)]
pub struct CancelHandle {
	root: CancelScope,
	registry: Arc<RunningTaskRegistry>,
	state: Arc<Mutex<StateCell>>,
}

impl CancelHandle {
	/// Move to `canceled`, record `error`, and signal every registered sub-task.
	/// Never fails. Repeated calls and calls after completion are no-ops.
	pub fn cancel(&self, error: TaskError) {
		{
			let mut cell = self.state.lock();
			if cell.state.is_terminal() {
				return;
			}
			cell.state = OrchestratorState::Canceled;
			cell.cancel_error = Some(error.clone());
		}

		self.root.cancel(error.clone());
		let signaled = self.registry.cancel_all(&error);
		tracing::info!(signaled, error = %error.clone().redacted(), "orchestrator canceled");
	}
}

pub struct BackupOrchestrator<J: BackupJob> {
	job: Arc<J>,
	config: Arc<OrchestratorConfig>,
	handle: CancelHandle,
}

impl<J: BackupJob> BackupOrchestrator<J> {
	pub fn new(job: J, config: OrchestratorConfig) -> Result<Self, TaskError> {
		config.validate()?;
		Ok(Self {
			job: Arc::new(job),
			config: Arc::new(config),
			handle: CancelHandle {
				root: CancelScope::new(),
				registry: Arc::new(RunningTaskRegistry::new()),
				state: Arc::new(Mutex::new(StateCell {
					state: OrchestratorState::Waiting,
					cancel_error: None,
				})),
			},
		})
	}

	pub fn job(&self) -> &J {
		&self.job
	}

	pub fn state(&self) -> OrchestratorState {
		self.handle.state.lock().state
	}

	pub fn cancel_error(&self) -> Option<TaskError> {
		self.handle.state.lock().cancel_error.clone()
	}

	pub fn registry(&self) -> &Arc<RunningTaskRegistry> {
		&self.handle.registry
	}

	pub fn cancel_handle(&self) -> CancelHandle {
		self.handle.clone()
	}

	pub fn cancel_task(&self, error: TaskError) {
		self.handle.cancel(error);
	}

	/// Run the job once. Orchestrator-level failures (enumeration, a second
	/// call, cancellation before start) are returned as `Err`; per-item
	/// failures land in their `TaskResult`. Results follow enumeration order.
	pub async fn run_task(&self) -> Result<Vec<TaskResult>, TaskError> {
		{
			let mut cell = self.handle.state.lock();
			match cell.state {
				OrchestratorState::Waiting => cell.state = OrchestratorState::Running,
				OrchestratorState::Canceled => {
					return Err(cell.cancel_error.clone().unwrap_or_else(|| TaskError::canceled("canceled")));
				}
				_ => return Err(TaskError::Internal("orchestrator already started".into())),
			}
		}

		let job_name = self.job.name().to_string();
		let ctx = JobContext {
			scope: self.handle.root.clone(),
			registry: self.handle.registry.clone(),
			retry: RetryExecutor::from_config(&self.config.retry),
			config: self.config.clone(),
		};

		let items = match self.job.enumerate(&ctx).await {
			Ok(items) => items,
			Err(err) => {
				self.finish();
				tracing::error!(job = %job_name, error = %err.clone().redacted(), "enumeration failed");
				return Err(err);
			}
		};
		tracing::info!(job = %job_name, items = items.len(), concurrency = self.config.concurrency, "work list ready");

		let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
		let mut handles = Vec::with_capacity(items.len());

		for item in items {
			let permit = semaphore
				.clone()
				.acquire_owned()
				.await
				.map_err(|e| TaskError::Internal(format!("limiter closed: {e}")))?;

			let params = self.job.describe(&item);
			let label = item.label.clone();
			let item_ctx = JobContext {
				scope: self.handle.root.child(),
				..ctx.clone()
			};
			// Registered before the task starts; the guard leaves with the task.
			let guard = self.handle.registry.register(Arc::new(item_ctx.scope.clone()));
			let job = self.job.clone();

			let handle = tokio::spawn(async move {
				let _guard = guard;
				let _permit = permit;
				let outcome = match item_ctx.scope.check() {
					Ok(()) => job.process(item, &item_ctx).await,
					Err(err) => Err(err),
				};
				match &outcome {
					Ok(result) => tracing::info!(item = %label, result = %result, "item done"),
					Err(err) if err.is_canceled() => tracing::debug!(item = %label, error = %err, "item canceled"),
					Err(err) => tracing::warn!(item = %label, error = %err.clone().redacted(), "item failed"),
				}
				outcome
			});
			handles.push((params, handle));
		}

		let mut results = Vec::with_capacity(handles.len());
		for (params, handle) in handles {
			let outcome = match handle.await {
				Ok(outcome) => outcome,
				Err(join_err) => Err(TaskError::Internal(format!("item task aborted: {join_err}"))),
			};
			results.push(TaskResult::new(params, outcome));
		}

		self.finish();
		Ok(results)
	}

	fn finish(&self) {
		let mut cell = self.handle.state.lock();
		if cell.state == OrchestratorState::Running {
			cell.state = OrchestratorState::Completed;
		}
	}
}

/// Drain an offset-paginated listing. Stops once `total_count` items arrived
/// or a page brings nothing new, whichever comes first.
pub async fn collect_pages<T, F, Fut>(limit: u32, mut fetch: F) -> Result<Vec<T>, TaskError>
where
	F: FnMut(u64, u32) -> Fut,
	Fut: Future<Output = Result<ListPage<T>, TaskError>>,
{
	let mut items = Vec::new();
	loop {
		let page = fetch(items.len() as u64, limit).await?;
		if page.items.is_empty() {
			break;
		}
		let total = page.total_count;
		items.extend(page.items);
		if items.len() as u64 >= total {
			break;
		}
	}
	Ok(items)
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration,
	};

	use relay_core::{ErrorKind, Locator};

	use super::*;

	struct ScriptedJob {
		items: Vec<(&'static str, u64, bool)>,
		enumerate_error: Option<TaskError>,
		running: AtomicUsize,
		peak: AtomicUsize,
	}

	impl ScriptedJob {
		fn new(items: Vec<(&'static str, u64, bool)>) -> Self {
			Self {
				items,
				enumerate_error: None,
				running: AtomicUsize::new(0),
				peak: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl BackupJob for ScriptedJob {
		fn name(&self) -> &str {
			"scripted"
		}

		async fn enumerate(&self, _ctx: &JobContext) -> Result<Vec<WorkItem>, TaskError> {
			if let Some(err) = &self.enumerate_error {
				return Err(err.clone());
			}
			Ok(self
				.items
				.iter()
				.map(|(name, delay_ms, fail)| {
					WorkItem::new(*name, Locator::Url { url: format!("https://src/{name}?sign=secret") })
						.with_var("delay", delay_ms.to_string())
						.with_var("fail", fail.to_string())
				})
				.collect())
		}

		async fn process(&self, item: WorkItem, ctx: &JobContext) -> Result<TaskOutcome, TaskError> {
			let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);

			let delay: u64 = item.var("delay").and_then(|d| d.parse().ok()).unwrap_or(0);
			let outcome = tokio::select! {
				_ = ctx.scope.cancelled() => Err(ctx.scope.error()),
				_ = tokio::time::sleep(Duration::from_millis(delay)) => {
					if item.var("fail") == Some("true") {
						Err(TaskError::transient(format!("https://src/{}?sign=secret unreachable", item.label)))
					} else {
						Ok(TaskOutcome::Completed(serde_json::json!({ "item": item.label })))
					}
				}
			};

			self.running.fetch_sub(1, Ordering::SeqCst);
			outcome
		}
	}

	fn labels(results: &[TaskResult]) -> Vec<&str> {
		results.iter().map(|r| r.params["label"].as_str()).collect()
	}

	#[tokio::test(start_paused = true)]
	async fn sequential_results_follow_enumeration_order() {
		let job = ScriptedJob::new(vec![("A", 5, false), ("B", 1, true), ("C", 3, false)]);
		let orchestrator = BackupOrchestrator::new(job, OrchestratorConfig::default()).unwrap();

		let results = orchestrator.run_task().await.unwrap();
		assert_eq!(labels(&results), ["A", "B", "C"]);
		assert!(results[0].is_success());
		assert_eq!(results[1].error().map(TaskError::kind), Some(ErrorKind::Transient));
		assert!(results[2].is_success());
		assert_eq!(orchestrator.state(), OrchestratorState::Completed);
		assert_eq!(orchestrator.job().peak.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn concurrent_results_keep_input_order_within_the_limit() {
		let job = ScriptedJob::new(vec![("A", 30, false), ("B", 10, false), ("C", 20, false), ("D", 1, false)]);
		let orchestrator = BackupOrchestrator::new(job, OrchestratorConfig::default().with_concurrency(2)).unwrap();

		let results = orchestrator.run_task().await.unwrap();
		assert_eq!(labels(&results), ["A", "B", "C", "D"]);
		assert_eq!(orchestrator.job().peak.load(Ordering::SeqCst), 2);
		assert!(orchestrator.registry().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn params_and_errors_are_redacted() {
		let job = ScriptedJob::new(vec![("A", 0, true)]);
		let orchestrator = BackupOrchestrator::new(job, OrchestratorConfig::default()).unwrap();

		let results = orchestrator.run_task().await.unwrap();
		assert_eq!(results[0].params["sourceUrl"], "https://src/A");
		let rendered = serde_json::to_string(&results[0]).unwrap();
		assert!(!rendered.contains("sign=secret"), "{rendered}");
	}

	#[tokio::test(start_paused = true)]
	async fn cancel_reaches_every_running_item() {
		let job = ScriptedJob::new(vec![("A", 10_000, false), ("B", 10_000, false), ("C", 10_000, false)]);
		let orchestrator = Arc::new(BackupOrchestrator::new(job, OrchestratorConfig::default().with_concurrency(3)).unwrap());

		let run = tokio::spawn({
			let orchestrator = orchestrator.clone();
			async move { orchestrator.run_task().await }
		});

		while orchestrator.registry().len() < 3 {
			tokio::task::yield_now().await;
		}
		orchestrator.cancel_task(TaskError::canceled("time limit"));
		orchestrator.cancel_task(TaskError::canceled("again"));
		assert!(orchestrator.registry().is_empty());

		let results = run.await.unwrap().unwrap();
		assert_eq!(results.len(), 3);
		for result in &results {
			assert_eq!(result.error(), Some(&TaskError::canceled("time limit")));
		}
		assert_eq!(orchestrator.state(), OrchestratorState::Canceled);
		assert_eq!(orchestrator.cancel_error(), Some(TaskError::canceled("time limit")));
	}

	#[tokio::test(start_paused = true)]
	async fn items_started_after_cancel_observe_the_error() {
		let job = ScriptedJob::new(vec![("A", 10_000, false), ("B", 0, false)]);
		let orchestrator = Arc::new(BackupOrchestrator::new(job, OrchestratorConfig::default()).unwrap());

		let run = tokio::spawn({
			let orchestrator = orchestrator.clone();
			async move { orchestrator.run_task().await }
		});
		while orchestrator.job().running.load(Ordering::SeqCst) == 0 {
			tokio::task::yield_now().await;
		}
		orchestrator.cancel_task(TaskError::canceled("time limit"));

		let results = run.await.unwrap().unwrap();
		assert!(results.iter().all(|r| r.error().is_some_and(TaskError::is_canceled)));
		// B never reached process().
		assert_eq!(orchestrator.job().peak.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn enumeration_failure_aborts_the_run() {
		let mut job = ScriptedJob::new(vec![("A", 0, false)]);
		job.enumerate_error = Some(TaskError::enumeration(
			"example.com",
			"DescribeCdnDomainLogs",
			&TaskError::transient("throttled"),
		));
		let orchestrator = BackupOrchestrator::new(job, OrchestratorConfig::default()).unwrap();

		let err = orchestrator.run_task().await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::EnumerationFailed);
		assert_eq!(orchestrator.job().peak.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn runs_only_once_and_not_after_cancel() {
		let orchestrator = BackupOrchestrator::new(ScriptedJob::new(vec![]), OrchestratorConfig::default()).unwrap();
		assert!(orchestrator.run_task().await.unwrap().is_empty());
		assert_eq!(orchestrator.run_task().await.unwrap_err().kind(), ErrorKind::Internal);
		// Completed is terminal; a late cancel changes nothing.
		orchestrator.cancel_task(TaskError::canceled("late"));
		assert_eq!(orchestrator.state(), OrchestratorState::Completed);

		let canceled = BackupOrchestrator::new(ScriptedJob::new(vec![]), OrchestratorConfig::default()).unwrap();
		canceled.cancel_task(TaskError::canceled("before start"));
		assert_eq!(canceled.run_task().await.unwrap_err(), TaskError::canceled("before start"));
	}

	#[test]
	fn invalid_config_is_rejected() {
		let err = BackupOrchestrator::new(ScriptedJob::new(vec![]), OrchestratorConfig::default().with_concurrency(0))
			.err()
			.unwrap();
		assert_eq!(err.kind(), ErrorKind::InvalidConfig);
	}

	async fn paged(n: usize, limit: u32, reported_total: u64) -> (Vec<usize>, usize) {
		let source: Vec<usize> = (0..n).collect();
		let mut calls = 0;
		let items = collect_pages(limit, |offset, limit| {
			calls += 1;
			let start = (offset as usize).min(source.len());
			let end = (start + limit as usize).min(source.len());
			let page = ListPage {
				items: source[start..end].to_vec(),
				total_count: reported_total,
			};
			async move { Ok(page) }
		})
		.await
		.unwrap();
		(items, calls)
	}

	#[tokio::test]
	async fn pagination_yields_every_item() {
		for (n, limit) in [(0, 10), (9, 10), (10, 10), (11, 10), (25, 7), (1, 1)] {
			let (items, _) = paged(n, limit, n as u64).await;
			assert_eq!(items, (0..n).collect::<Vec<_>>(), "n={n} limit={limit}");
		}
	}

	#[tokio::test]
	async fn pagination_stops_on_inconsistent_total() {
		let (items, calls) = paged(5, 2, 100).await;
		assert_eq!(items.len(), 5);
		assert_eq!(calls, 4);
	}

	#[tokio::test]
	async fn pagination_surfaces_listing_errors() {
		let err = collect_pages::<u32, _, _>(10, |_, _| async { Err(TaskError::transient("503")) })
			.await
			.unwrap_err();
		assert!(err.is_retryable());
	}
}
