use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relay_core::{
	config::{OrchestratorConfig, TimeoutConfig},
	LogSummary, TaskError,
};
use relay_engine::{
	local::LocalStore,
	tasks::{CdnLogBackupJob, HashCalculateJob, PostgresBackupJob},
	BackupJob, BackupOrchestrator, TimeoutWatcher,
};

use crate::{
	event::Event,
	manifest::{ManifestBackupSource, ManifestCdnSource},
	settings::Settings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
	CdnLog,
	Hash,
	PgBackup,
}

/// Wire the job named by `kind` from settings and event, run it under the
/// time budget, and summarize.
pub async fn run(kind: JobKind, settings: Settings, event: Event, now: DateTime<Utc>) -> Result<LogSummary> {
	let store = Arc::new(LocalStore::new(settings.local.root.clone()));
	let mut timeout = settings.timeout.clone();
	if let Some(limit) = event.context.time_limit_in_ms {
		timeout.time_limit_ms = limit;
	}

	match kind {
		JobKind::CdnLog => {
			let cdn = settings.cdn_log.context("settings have no [cdn_log] section")?;
			let mut config = cdn.job;
			if let Some(domains) = event.domains {
				config.domains = domains;
			}
			if let Some(days) = event.back_track_days {
				config.back_track_days = days;
			}
			if event.time_range.is_some() {
				config.time_range = event.time_range;
			}

			let source = Arc::new(ManifestCdnSource::load(&cdn.manifest)?);
			let orchestrator = config.orchestrator.clone();
			let job = CdnLogBackupJob::new(config, source, store.clone(), store, now)?;
			execute(job, orchestrator, &timeout).await
		}
		JobKind::Hash => {
			let config = settings.hash.context("settings have no [hash] section")?;
			let orchestrator = config.orchestrator.clone();
			let job = HashCalculateJob::new(config, store.clone(), store)?;
			execute(job, orchestrator, &timeout).await
		}
		JobKind::PgBackup => {
			let pg = settings.pg_backup.context("settings have no [pg_backup] section")?;
			let mut config = pg.job;
			if let Some(instances) = event.instances {
				config.instances = instances;
			}
			if let Some(days) = event.back_track_days {
				config.back_track_days = days;
			}
			if event.time_range.is_some() {
				config.time_range = event.time_range;
			}

			let source = Arc::new(ManifestBackupSource::load(&pg.manifest)?);
			let orchestrator = config.orchestrator.clone();
			let job = PostgresBackupJob::new(config, source, store.clone(), store, now)?;
			execute(job, orchestrator, &timeout).await
		}
	}
}

async fn execute<J: BackupJob>(job: J, config: OrchestratorConfig, timeout: &TimeoutConfig) -> Result<LogSummary> {
	let name = job.name().to_string();
	let orchestrator = BackupOrchestrator::new(job, config)?;

	let handle = orchestrator.cancel_handle();
	let watcher = TimeoutWatcher::start(
		timeout,
		TaskError::canceled("execution time limit reached"),
		move |err| handle.cancel(err),
	);
	tracing::info!(job = %name, budget_ms = watcher.remaining().as_millis() as u64, "run started");

	let results = orchestrator.run_task().await;
	let timed_out = watcher.is_timeout();
	watcher.clear();

	let results = results?;
	if timed_out {
		tracing::warn!(job = %name, "run stopped by the time limit; remaining items were canceled");
	}
	tracing::info!(job = %name, items = results.len(), "run finished");
	Ok(LogSummary::from_results(&name, &results))
}
