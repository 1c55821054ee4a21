//! Listing sources backed by JSON manifest files, for the local backend.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use relay_core::{config::BackupType, TaskError};
use relay_engine::services::{
	CdnLogRecord, CdnLogSource, DbBackupRecord, DbBackupSource, ListPage, ListQuery, SignedUrl,
};
use serde::Deserialize;

/// Lifetime reported for manifest download URLs.
const URL_TTL_HOURS: i64 = 1;

#[derive(Debug, Clone, Deserialize)]
struct LogEntry {
	url: String,
	name: String,
	start_time: DateTime<Utc>,
	#[serde(default)]
	end_time: Option<DateTime<Utc>>,
	#[serde(default)]
	size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct BackupEntry {
	backup_id: String,
	backup_type: BackupType,
	file_name: String,
	url: String,
	#[serde(default)]
	size: Option<u64>,
	#[serde(default)]
	finished_at: Option<DateTime<Utc>>,
}

fn read_manifest<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<BTreeMap<String, Vec<T>>> {
	let raw = std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
	serde_json::from_str(&raw).with_context(|| format!("parsing manifest {}", path.display()))
}

fn page<T: Clone>(all: &[T], query: &ListQuery) -> ListPage<T> {
	let start = (query.offset as usize).min(all.len());
	let end = (start + query.limit as usize).min(all.len());
	ListPage {
		items: all[start..end].to_vec(),
		total_count: all.len() as u64,
	}
}

/// `{"<domain>": [{"url", "name", "start_time", ...}]}`
pub struct ManifestCdnSource {
	domains: BTreeMap<String, Vec<LogEntry>>,
}

impl ManifestCdnSource {
	pub fn load(path: &Path) -> Result<Self> {
		Ok(Self {
			domains: read_manifest(path)?,
		})
	}
}

#[async_trait]
impl CdnLogSource for ManifestCdnSource {
	async fn list_logs(&self, query: &ListQuery) -> Result<ListPage<CdnLogRecord>, TaskError> {
		let logs: Vec<CdnLogRecord> = self
			.domains
			.get(&query.scope)
			.into_iter()
			.flatten()
			.filter(|e| e.start_time >= query.window.start && e.start_time < query.window.end)
			.map(|e| CdnLogRecord {
				log_path: e.url.clone(),
				log_name: e.name.clone(),
				start_time: e.start_time,
				end_time: e.end_time,
				size: e.size,
			})
			.collect();
		Ok(page(&logs, query))
	}
}

/// `{"<instance>": [{"backup_id", "backup_type", "file_name", "url", ...}]}`
pub struct ManifestBackupSource {
	instances: BTreeMap<String, Vec<BackupEntry>>,
}

impl ManifestBackupSource {
	pub fn load(path: &Path) -> Result<Self> {
		Ok(Self {
			instances: read_manifest(path)?,
		})
	}

	fn entry(&self, backup: &DbBackupRecord) -> Option<&BackupEntry> {
		self.instances
			.get(&backup.instance_id)?
			.iter()
			.find(|e| e.backup_id == backup.backup_id)
	}
}

#[async_trait]
impl DbBackupSource for ManifestBackupSource {
	async fn list_backups(&self, backup_type: BackupType, query: &ListQuery) -> Result<ListPage<DbBackupRecord>, TaskError> {
		let backups: Vec<DbBackupRecord> = self
			.instances
			.get(&query.scope)
			.into_iter()
			.flatten()
			.filter(|e| e.backup_type == backup_type)
			.filter(|e| e.finished_at.map_or(true, |at| at >= query.window.start && at < query.window.end))
			.map(|e| DbBackupRecord {
				instance_id: query.scope.clone(),
				backup_id: e.backup_id.clone(),
				backup_type: e.backup_type,
				file_name: e.file_name.clone(),
				size: e.size,
				finished_at: e.finished_at,
			})
			.collect();
		Ok(page(&backups, query))
	}

	async fn resolve_download_url(&self, backup: &DbBackupRecord) -> Result<SignedUrl, TaskError> {
		let entry = self
			.entry(backup)
			.ok_or_else(|| TaskError::NotFound(format!("backup {} of {}", backup.backup_id, backup.instance_id)))?;
		Ok(SignedUrl {
			url: entry.url.clone(),
			expires_at: Some(Utc::now() + Duration::hours(URL_TTL_HOURS)),
		})
	}
}
