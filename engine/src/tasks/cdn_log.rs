use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
	config::{CdnLogBackupConfig, TimeWindow},
	is_signed_url, Locator, ObjectRef, TaskError, TaskOutcome, TaskParams, WorkItem,
};

use super::{target_for, url_key, wrap_listing_error};
use crate::{
	copier::{CopyPlan, Copier},
	orchestrator::{collect_pages, BackupJob, JobContext},
	services::{CdnLogSource, ListQuery, ObjectStore, UrlFetcher},
};

const LIST_ACTION: &str = "DescribeCdnDomainLogs";

/// Copies CDN access logs of the configured domains into the target bucket,
/// one work item per log URL.
pub struct CdnLogBackupJob {
	config: CdnLogBackupConfig,
	window: TimeWindow,
	source: Arc<dyn CdnLogSource>,
	copier: Copier,
}

impl CdnLogBackupJob {
	pub const NAME: &'static str = "cdn-log-backup";

	pub fn new(
		config: CdnLogBackupConfig,
		source: Arc<dyn CdnLogSource>,
		fetcher: Arc<dyn UrlFetcher>,
		store: Arc<dyn ObjectStore>,
		now: DateTime<Utc>,
	) -> Result<Self, TaskError> {
		config.validate()?;
		let window = TimeWindow::resolve(config.time_range, config.back_track_days, now);
		let copier = Copier::new(fetcher, store, Self::NAME, Duration::from_secs(config.target.sign_expires_secs));
		Ok(Self {
			config,
			window,
			source,
			copier,
		})
	}

	pub fn window(&self) -> TimeWindow {
		self.window
	}
}

/// Unsigned bucket URLs are read through the store, which signs them.
fn log_locator(log_path: &str) -> Locator {
	match ObjectRef::from_url(log_path) {
		Some(object) if !is_signed_url(log_path) => Locator::Object(object),
		_ => Locator::Url {
			url: log_path.to_string(),
		},
	}
}

#[async_trait]
impl BackupJob for CdnLogBackupJob {
	fn name(&self) -> &str {
		Self::NAME
	}

	async fn enumerate(&self, ctx: &JobContext) -> Result<Vec<WorkItem>, TaskError> {
		let mut items = Vec::new();

		for domain in &self.config.domains {
			let source = self.source.as_ref();
			let window = self.window;
			let records = collect_pages(self.config.page_size, |offset, limit| {
				let query = ListQuery {
					scope: domain.clone(),
					window,
					offset,
					limit,
				};
				async move {
					ctx.retry
						.run(Some(&ctx.scope), LIST_ACTION, |_| source.list_logs(&query))
						.await
				}
			})
			.await
			.map_err(|err| wrap_listing_error(domain, LIST_ACTION, err))?;

			tracing::info!(domain = %domain, logs = records.len(), "cdn logs listed");

			items.extend(records.into_iter().map(|record| {
				let mut item = WorkItem::new(&record.log_name, log_locator(&record.log_path))
					.with_var("Domain", domain)
					.with_var("LogName", &record.log_name)
					.with_var("Date", record.start_time.format("%Y%m%d").to_string())
					.with_var("Key", url_key(&record.log_path));
				if let Some(size) = record.size {
					item = item.with_content_length(size);
				}
				item
			}));
		}

		Ok(items)
	}

	fn describe(&self, item: &WorkItem) -> TaskParams {
		TaskParams::from([
			("domain".to_string(), item.var("Domain").unwrap_or_default().to_string()),
			("label".to_string(), item.label.clone()),
			("sourceUrl".to_string(), item.locator.redacted()),
			("targetUrl".to_string(), target_for(&self.config.target, item).to_string()),
		])
	}

	async fn process(&self, item: WorkItem, ctx: &JobContext) -> Result<TaskOutcome, TaskError> {
		let source_url = match &item.locator {
			Locator::Url { url } => url.clone(),
			Locator::Object(object) => self.copier.store().object_url(
				object,
				true,
				Duration::from_secs(self.config.target.sign_expires_secs),
			),
		};
		let plan = CopyPlan::new(source_url, target_for(&self.config.target, &item));
		self.copier.copy_item(&item, plan, ctx).await
	}
}
