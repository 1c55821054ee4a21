//! The backup jobs run by the orchestrator.

mod cdn_log;
mod hash_calculate;
mod postgres_backup;

pub use cdn_log::CdnLogBackupJob;
pub use hash_calculate::{HashCalculateJob, MultiHasher};
pub use postgres_backup::{BackupUrlResolver, PostgresBackupJob};

use relay_core::{config::TargetConfig, render_key_template, ObjectRef, TaskError, WorkItem};

/// Target object for an item, from the configured key template.
pub(crate) fn target_for(target: &TargetConfig, item: &WorkItem) -> ObjectRef {
	target.object(render_key_template(&target.key_template, &item.template_vars))
}

/// Enumeration errors carry the listing scope and API action; cancellation passes through.
pub(crate) fn wrap_listing_error(scope: &str, action: &str, err: TaskError) -> TaskError {
	if err.is_canceled() {
		err
	} else {
		TaskError::enumeration(scope, action, &err)
	}
}

/// Path part of a URL without scheme, host or query, used as the default object key.
pub(crate) fn url_key(url: &str) -> String {
	let without_query = url.split('?').next().unwrap_or(url);
	let without_scheme = without_query.split_once("://").map_or(without_query, |(_, rest)| rest);
	match without_scheme.split_once('/') {
		Some((_, path)) => path.to_string(),
		None => String::new(),
	}
}
