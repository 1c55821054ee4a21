use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use relay_core::config::{CdnLogBackupConfig, HashCalculateConfig, PostgresBackupConfig, TargetConfig, TimeoutConfig};
use serde::Deserialize;

/// Where the local backend keeps its buckets.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
	pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdnLogSettings {
	/// JSON listing of log files per domain.
	pub manifest: PathBuf,
	#[serde(flatten)]
	pub job: CdnLogBackupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PgBackupSettings {
	/// JSON listing of backup files per instance.
	pub manifest: PathBuf,
	#[serde(flatten)]
	pub job: PostgresBackupConfig,
}

/// Contents of the `--config` TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub local: LocalSettings,
	#[serde(default)]
	pub timeout: TimeoutConfig,
	pub cdn_log: Option<CdnLogSettings>,
	pub hash: Option<HashCalculateConfig>,
	pub pg_backup: Option<PgBackupSettings>,
}

impl Settings {
	pub fn load(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).with_context(|| format!("reading settings {}", path.display()))?;
		Self::parse(&raw).with_context(|| format!("parsing settings {}", path.display()))
	}

	pub fn parse(raw: &str) -> Result<Self> {
		let mut settings: Settings = toml::from_str(raw)?;
		settings.resolve_paths();
		Ok(settings)
	}

	/// Relative manifest paths are taken relative to the local root.
	fn resolve_paths(&mut self) {
		let root = self.local.root.clone();
		if let Some(cdn) = &mut self.cdn_log {
			if cdn.manifest.is_relative() {
				cdn.manifest = root.join(&cdn.manifest);
			}
		}
		if let Some(pg) = &mut self.pg_backup {
			if pg.manifest.is_relative() {
				pg.manifest = root.join(&pg.manifest);
			}
		}
	}

	/// Overlay deployment variables. `RELAY_*` names win over the legacy ones.
	pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
	where
		F: Fn(&str) -> Option<String>,
	{
		let var = |names: &[&str]| names.iter().find_map(|name| lookup(*name).filter(|v| !v.is_empty()));

		if let Some(root) = var(&["RELAY_LOCAL_ROOT"]) {
			self.local.root = PathBuf::from(root);
		}
		let bucket = var(&["RELAY_TARGET_BUCKET", "targetBucket"]);
		let region = var(&["RELAY_TARGET_REGION", "targetRegion"]);
		let template = var(&["RELAY_TARGET_KEY_TEMPLATE", "targetKeyTemplate"]);
		let prefix = var(&["RELAY_TARGET_PREFIX", "targetPrefix"]);
		let days = var(&["RELAY_BACK_TRACK_DAYS", "backTrackDays"])
			.map(|d| d.parse::<u32>().with_context(|| format!("backTrackDays must be a number, got {d:?}")))
			.transpose()?;

		let overlay_target = |target: &mut TargetConfig| {
			if let Some(bucket) = &bucket {
				target.bucket = bucket.clone();
			}
			if let Some(region) = &region {
				target.region = region.clone();
			}
			if let Some(prefix) = &prefix {
				*target = target.clone().with_prefix(prefix);
			}
			if let Some(template) = &template {
				target.key_template = template.clone();
			}
		};

		if let Some(cdn) = &mut self.cdn_log {
			overlay_target(&mut cdn.job.target);
			if let Some(days) = days {
				cdn.job.back_track_days = days;
			}
		}
		if let Some(pg) = &mut self.pg_backup {
			overlay_target(&mut pg.job.target);
			if let Some(days) = days {
				pg.job.back_track_days = days;
			}
		}
		Ok(())
	}
}
