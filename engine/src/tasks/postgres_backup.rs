use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
	config::{BackupType, PostgresBackupConfig, TimeWindow},
	Locator, TaskError, TaskOutcome, TaskParams, WorkItem,
};

use super::{target_for, wrap_listing_error};
use crate::{
	copier::{CopyPlan, Copier},
	orchestrator::{collect_pages, BackupJob, JobContext},
	services::{DbBackupRecord, DbBackupSource, ListQuery, ObjectStore, SignedUrl, UrlFetcher, UrlResolver},
};

const LIST_ACTION: &str = "DescribeBackups";
const RESOLVE_ACTION: &str = "DescribeBackupDownloadUrl";

/// Re-issues backup download URLs from the identity stored in the item's
/// template variables.
pub struct BackupUrlResolver {
	source: Arc<dyn DbBackupSource>,
}

impl BackupUrlResolver {
	pub fn new(source: Arc<dyn DbBackupSource>) -> Self {
		Self { source }
	}

	fn record_of(item: &WorkItem) -> Result<DbBackupRecord, TaskError> {
		let var = |name: &str| {
			item.var(name)
				.map(str::to_string)
				.ok_or_else(|| TaskError::Internal(format!("work item {} lacks {name}", item.label)))
		};
		let backup_type = var("BackupType")?;
		Ok(DbBackupRecord {
			instance_id: var("InstanceId")?,
			backup_id: var("BackupId")?,
			backup_type: BackupType::parse(&backup_type)
				.ok_or_else(|| TaskError::Internal(format!("unknown backup type {backup_type}")))?,
			file_name: var("FileName")?,
			size: item.content_length,
			finished_at: None,
		})
	}
}

#[async_trait]
impl UrlResolver for BackupUrlResolver {
	async fn resolve(&self, item: &WorkItem) -> Result<SignedUrl, TaskError> {
		let record = Self::record_of(item)?;
		self.source.resolve_download_url(&record).await
	}
}

/// Copies database backup files (physical, logical, WAL) of the configured
/// instances into the target bucket.
pub struct PostgresBackupJob {
	config: PostgresBackupConfig,
	window: TimeWindow,
	source: Arc<dyn DbBackupSource>,
	resolver: Arc<BackupUrlResolver>,
	copier: Copier,
}

impl PostgresBackupJob {
	pub const NAME: &'static str = "pg-backup";

	pub fn new(
		config: PostgresBackupConfig,
		source: Arc<dyn DbBackupSource>,
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
			resolver: Arc::new(BackupUrlResolver::new(source.clone())),
			source,
			copier,
		})
	}

	async fn list(&self, instance: &str, backup_type: BackupType, ctx: &JobContext) -> Result<Vec<DbBackupRecord>, TaskError> {
		let source = self.source.as_ref();
		let window = self.window;
		collect_pages(self.config.page_size, |offset, limit| {
			let query = ListQuery {
				scope: instance.to_string(),
				window,
				offset,
				limit,
			};
			async move {
				ctx.retry
					.run(Some(&ctx.scope), LIST_ACTION, |_| source.list_backups(backup_type, &query))
					.await
			}
		})
		.await
	}

	fn work_item(record: &DbBackupRecord, signed: SignedUrl) -> WorkItem {
		let mut item = WorkItem::new(&record.file_name, Locator::Url { url: signed.url })
			.with_var("InstanceId", &record.instance_id)
			.with_var("BackupId", &record.backup_id)
			.with_var("BackupType", record.backup_type.as_str())
			.with_var("FileName", &record.file_name)
			.with_var(
				"Key",
				format!("{}/{}/{}", record.instance_id, record.backup_type.as_str(), record.file_name),
			);
		if let Some(finished) = record.finished_at {
			item = item.with_var("Date", finished.format("%Y%m%d").to_string());
		}
		if let Some(size) = record.size {
			item = item.with_content_length(size);
		}
		if let Some(expires_at) = signed.expires_at {
			item = item.with_expiry(expires_at);
		}
		item
	}
}

#[async_trait]
impl BackupJob for PostgresBackupJob {
	fn name(&self) -> &str {
		Self::NAME
	}

	async fn enumerate(&self, ctx: &JobContext) -> Result<Vec<WorkItem>, TaskError> {
		let mut items = Vec::new();

		for instance in &self.config.instances {
			for &backup_type in &self.config.backup_types {
				let records = self
					.list(instance, backup_type, ctx)
					.await
					.map_err(|err| wrap_listing_error(instance, LIST_ACTION, err))?;

				for record in records {
					let signed = ctx
						.retry
						.run(Some(&ctx.scope), RESOLVE_ACTION, |_| self.source.resolve_download_url(&record))
						.await
						.map_err(|err| wrap_listing_error(instance, RESOLVE_ACTION, err))?;
					items.push(Self::work_item(&record, signed));
				}

				tracing::info!(instance = %instance, backup_type = backup_type.as_str(), items = items.len(), "backups listed");
			}
		}

		Ok(items)
	}

	fn describe(&self, item: &WorkItem) -> TaskParams {
		TaskParams::from([
			("instanceId".to_string(), item.var("InstanceId").unwrap_or_default().to_string()),
			("backupType".to_string(), item.var("BackupType").unwrap_or_default().to_string()),
			("label".to_string(), item.label.clone()),
			("sourceUrl".to_string(), item.locator.redacted()),
			("targetUrl".to_string(), target_for(&self.config.target, item).to_string()),
		])
	}

	async fn process(&self, item: WorkItem, ctx: &JobContext) -> Result<TaskOutcome, TaskError> {
		let Locator::Url { url } = &item.locator else {
			return Err(TaskError::Internal(format!("backup {} has no download url", item.label)));
		};

		// A URL that expired while earlier items ran is replaced before use.
		let margin = Duration::from_millis(ctx.config.renewal.safety_margin_ms);
		let now = Utc::now();
		let listed = SignedUrl {
			url: url.clone(),
			expires_at: item.expires_at,
		};
		let current = match listed.ttl(now) {
			Some(ttl) if ttl > margin => listed,
			_ if item.expires_at.is_none() => listed,
			_ => {
				tracing::debug!(item = %item.label, "download url near expiry, resolving again");
				ctx.retry
					.run(Some(&ctx.scope), RESOLVE_ACTION, |_| self.resolver.resolve(&item))
					.await?
			}
		};

		let ttl = current.ttl(now);
		let plan = CopyPlan::new(current.url, target_for(&self.config.target, &item)).with_renewal(self.resolver.clone(), ttl);
		self.copier.copy_item(&item, plan, ctx).await
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use relay_core::{
		config::{OrchestratorConfig, TargetConfig},
		ErrorKind, ObjectRef,
	};

	use super::*;
	use crate::{local::LocalStore, orchestrator::BackupOrchestrator, test_support::FakeBackups};

	fn record(instance: &str, backup_type: BackupType, file: &str) -> DbBackupRecord {
		DbBackupRecord {
			instance_id: instance.into(),
			backup_id: format!("{file}-id"),
			backup_type,
			file_name: file.into(),
			size: None,
			finished_at: Some(Utc::now()),
		}
	}

	/// Backups whose download URLs point into the local store's `exports` bucket.
	async fn fixture(store: &LocalStore) -> FakeBackups {
		let base = store.object_url(&ObjectRef::new("exports", "r", "pg"), false, Duration::ZERO);
		let mut backups = FakeBackups::new(&base);
		for (instance, backup_type, file) in [
			("pg-1", BackupType::Physical, "base.tar"),
			("pg-1", BackupType::Wal, "000001.wal"),
			("pg-1", BackupType::Wal, "000002.wal"),
			("pg-2", BackupType::Logical, "dump.sql"),
		] {
			store
				.write_object(
					&ObjectRef::new("exports", "r", format!("pg/{file}")),
					format!("{instance} {file}").as_bytes(),
					BTreeMap::new(),
				)
				.await
				.unwrap();
			let scope = FakeBackups::scope(instance, backup_type);
			backups.listing.records.entry(scope).or_default().push(record(instance, backup_type, file));
		}
		backups
	}

	fn config() -> PostgresBackupConfig {
		let mut config = PostgresBackupConfig::new(
			vec!["pg-1".into(), "pg-2".into()],
			TargetConfig::new("backup", "ap-test").with_key_template("pg/${Key}"),
		);
		config.page_size = 1;
		config.orchestrator = OrchestratorConfig::default().with_concurrency(2);
		config.orchestrator.retry.delay_ms = 0;
		config
	}

	#[tokio::test]
	async fn copies_every_type_of_every_instance_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(LocalStore::new(dir.path()));
		let backups = Arc::new(fixture(&store).await);

		let job = PostgresBackupJob::new(config(), backups.clone(), store.clone(), store.clone(), Utc::now()).unwrap();
		let results = BackupOrchestrator::new(job, config().orchestrator).unwrap().run_task().await.unwrap();

		let labels: Vec<_> = results.iter().map(|r| r.params["label"].as_str()).collect();
		assert_eq!(labels, ["base.tar", "000001.wal", "000002.wal", "dump.sql"]);
		assert!(results.iter().all(|r| r.is_success()), "{results:?}");
		assert!(results.iter().all(|r| !r.params["sourceUrl"].contains("sign=")));
		assert_eq!(*backups.resolved.lock(), 4);
		assert_eq!(
			std::fs::read(dir.path().join("backup/pg/pg-1/wal/000002.wal")).unwrap(),
			b"pg-1 000002.wal"
		);
	}

	#[tokio::test]
	async fn expired_url_is_resolved_again_before_copy() {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(LocalStore::new(dir.path()));
		let mut backups = fixture(&store).await;
		// Issued URLs are already inside the renewal margin.
		backups.ttl = chrono::Duration::seconds(1);
		let backups = Arc::new(backups);

		let mut config = config();
		config.instances = vec!["pg-2".into()];
		config.orchestrator.renewal.min_interval_ms = 60_000;
		let job = PostgresBackupJob::new(config.clone(), backups.clone(), store.clone(), store, Utc::now()).unwrap();
		let results = BackupOrchestrator::new(job, config.orchestrator).unwrap().run_task().await.unwrap();

		assert_eq!(results.len(), 1);
		assert!(results[0].is_success());
		// Once while listing, once more before the copy.
		assert_eq!(*backups.resolved.lock(), 2);
	}

	#[test]
	fn resolver_rebuilds_the_backup_identity() {
		let signed = SignedUrl {
			url: "https://dl/base.tar?sign=1".into(),
			expires_at: None,
		};
		let item = PostgresBackupJob::work_item(&record("pg-1", BackupType::Physical, "base.tar"), signed);
		let rebuilt = BackupUrlResolver::record_of(&item).unwrap();
		assert_eq!(rebuilt.instance_id, "pg-1");
		assert_eq!(rebuilt.backup_type, BackupType::Physical);
		assert_eq!(rebuilt.backup_id, "base.tar-id");

		let bare = WorkItem::new("x", Locator::Url { url: "https://dl/x".into() });
		assert_eq!(BackupUrlResolver::record_of(&bare).unwrap_err().kind(), ErrorKind::Internal);
	}
}
