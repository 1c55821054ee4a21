//! Typed configuration for every engine component.
//!
//! All durations are milliseconds so the structs map one to one onto TOML
//! settings and invocation events.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::TaskError, models::ObjectRef};

pub const DEFAULT_KEY_TEMPLATE: &str = "${Key}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub delay_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			delay_ms: 1000,
		}
	}
}

impl RetryConfig {
	pub fn delay(&self) -> Duration {
		Duration::from_millis(self.delay_ms)
	}

	pub fn validate(&self) -> Result<(), TaskError> {
		if self.max_attempts == 0 {
			return Err(TaskError::InvalidConfig("retry.max_attempts must be at least 1".into()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
	pub time_limit_ms: u64,
	/// Time left for final logging after the trigger fires.
	pub safety_margin_ms: u64,
}

impl Default for TimeoutConfig {
	fn default() -> Self {
		Self {
			time_limit_ms: 15 * 60 * 1000,
			safety_margin_ms: 10_000,
		}
	}
}

impl TimeoutConfig {
	pub fn trigger_after(&self) -> Duration {
		Duration::from_millis(self.time_limit_ms.saturating_sub(self.safety_margin_ms))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
	/// Objects up to this size go in a single put; larger ones are split into parts of this size.
	pub part_size: u64,
	pub part_concurrency: usize,
}

impl Default for TransferConfig {
	fn default() -> Self {
		Self {
			part_size: 8 * 1024 * 1024,
			part_concurrency: 3,
		}
	}
}

impl TransferConfig {
	pub fn validate(&self) -> Result<(), TaskError> {
		if self.part_size == 0 {
			return Err(TaskError::InvalidConfig("transfer.part_size must be positive".into()));
		}
		if self.part_concurrency == 0 {
			return Err(TaskError::InvalidConfig("transfer.part_concurrency must be at least 1".into()));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalConfig {
	/// Assumed lifetime of a signed URL when the source does not report one.
	pub default_ttl_ms: u64,
	/// Renew this long before the URL expires.
	pub safety_margin_ms: u64,
	/// Lower bound for the renewal interval.
	pub min_interval_ms: u64,
}

impl Default for RenewalConfig {
	fn default() -> Self {
		Self {
			default_ttl_ms: 60 * 60 * 1000,
			safety_margin_ms: 5 * 60 * 1000,
			min_interval_ms: 1000,
		}
	}
}

impl RenewalConfig {
	/// Interval between re-resolutions for a URL valid for `ttl`.
	pub fn interval_for(&self, ttl: Duration) -> Duration {
		let margin = Duration::from_millis(self.safety_margin_ms);
		ttl.saturating_sub(margin)
			.max(Duration::from_millis(self.min_interval_ms))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
	/// Work items in flight at once.
	pub concurrency: usize,
	/// Skip sources that carry this pipeline's marker.
	pub avoid_loop_risk: bool,
	pub retry: RetryConfig,
	pub transfer: TransferConfig,
	pub renewal: RenewalConfig,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			concurrency: 1,
			avoid_loop_risk: false,
			retry: RetryConfig::default(),
			transfer: TransferConfig::default(),
			renewal: RenewalConfig::default(),
		}
	}
}

impl OrchestratorConfig {
	pub fn with_concurrency(mut self, concurrency: usize) -> Self {
		self.concurrency = concurrency;
		self
	}

	pub fn validate(&self) -> Result<(), TaskError> {
		if self.concurrency == 0 {
			return Err(TaskError::InvalidConfig("concurrency must be at least 1".into()));
		}
		self.retry.validate()?;
		self.transfer.validate()
	}
}

/// Where copies land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
	pub bucket: String,
	pub region: String,
	#[serde(default = "default_key_template")]
	pub key_template: String,
	/// Lifetime of signed target URLs used for verification.
	#[serde(default = "default_sign_expires")]
	pub sign_expires_secs: u64,
}

fn default_key_template() -> String {
	DEFAULT_KEY_TEMPLATE.to_string()
}

fn default_sign_expires() -> u64 {
	3600
}

impl TargetConfig {
	pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
		Self {
			bucket: bucket.into(),
			region: region.into(),
			key_template: default_key_template(),
			sign_expires_secs: default_sign_expires(),
		}
	}

	pub fn with_key_template(mut self, template: impl Into<String>) -> Self {
		self.key_template = template.into();
		self
	}

	/// Build the template from a bare prefix, the way prefix-only settings are expressed.
	pub fn with_prefix(self, prefix: &str) -> Self {
		self.with_key_template(format!("{prefix}{DEFAULT_KEY_TEMPLATE}"))
	}

	pub fn object(&self, key: impl Into<String>) -> ObjectRef {
		ObjectRef::new(&self.bucket, &self.region, key)
	}

	pub fn validate(&self) -> Result<(), TaskError> {
		if self.bucket.is_empty() || self.region.is_empty() {
			return Err(TaskError::InvalidConfig("target bucket and region are required".into()));
		}
		Ok(())
	}
}

/// Half-open time range used to query listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
}

impl TimeWindow {
	pub fn back_track(days: u32, now: DateTime<Utc>) -> Self {
		Self {
			start: now - ChronoDuration::days(i64::from(days)),
			end: now,
		}
	}

	/// An explicit range wins over the lookback.
	pub fn resolve(explicit: Option<TimeWindow>, back_track_days: u32, now: DateTime<Utc>) -> Self {
		explicit.unwrap_or_else(|| Self::back_track(back_track_days, now))
	}
}

fn default_back_track_days() -> u32 {
	3
}

fn default_page_size() -> u32 {
	100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnLogBackupConfig {
	pub domains: Vec<String>,
	#[serde(default = "default_back_track_days")]
	pub back_track_days: u32,
	#[serde(default)]
	pub time_range: Option<TimeWindow>,
	#[serde(default = "default_page_size")]
	pub page_size: u32,
	pub target: TargetConfig,
	#[serde(default)]
	pub orchestrator: OrchestratorConfig,
}

impl CdnLogBackupConfig {
	pub fn new(domains: Vec<String>, target: TargetConfig) -> Self {
		Self {
			domains,
			back_track_days: default_back_track_days(),
			time_range: None,
			page_size: default_page_size(),
			target,
			orchestrator: OrchestratorConfig::default(),
		}
	}

	pub fn validate(&self) -> Result<(), TaskError> {
		if self.domains.is_empty() {
			return Err(TaskError::InvalidConfig("at least one CDN domain is required".into()));
		}
		if self.page_size == 0 {
			return Err(TaskError::InvalidConfig("page_size must be positive".into()));
		}
		self.target.validate()?;
		self.orchestrator.validate()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
	Crc64,
	Sha256,
	Blake3,
}

impl HashAlgorithm {
	pub fn as_str(&self) -> &'static str {
		match self {
			HashAlgorithm::Crc64 => "crc64",
			HashAlgorithm::Sha256 => "sha256",
			HashAlgorithm::Blake3 => "blake3",
		}
	}

	/// Tag key the computed value is stored under.
	pub fn tag_key(&self) -> String {
		format!("relay-{}", self.as_str())
	}
}

/// A prefix of a bucket to enumerate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixSource {
	pub bucket: String,
	pub region: String,
	#[serde(default)]
	pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCalculateConfig {
	#[serde(default)]
	pub objects: Vec<ObjectRef>,
	#[serde(default)]
	pub prefixes: Vec<PrefixSource>,
	#[serde(default = "default_algorithms")]
	pub algorithms: Vec<HashAlgorithm>,
	#[serde(default = "default_list_page_size")]
	pub page_size: u32,
	/// Lifetime of the signed URLs the objects are streamed from.
	#[serde(default = "default_sign_expires")]
	pub sign_expires_secs: u64,
	#[serde(default = "default_hash_orchestrator")]
	pub orchestrator: OrchestratorConfig,
}

fn default_algorithms() -> Vec<HashAlgorithm> {
	vec![HashAlgorithm::Crc64, HashAlgorithm::Sha256]
}

fn default_list_page_size() -> u32 {
	1000
}

fn default_hash_orchestrator() -> OrchestratorConfig {
	OrchestratorConfig::default().with_concurrency(3)
}

impl Default for HashCalculateConfig {
	fn default() -> Self {
		Self {
			objects: Vec::new(),
			prefixes: Vec::new(),
			algorithms: default_algorithms(),
			page_size: default_list_page_size(),
			sign_expires_secs: default_sign_expires(),
			orchestrator: default_hash_orchestrator(),
		}
	}
}

impl HashCalculateConfig {
	pub fn validate(&self) -> Result<(), TaskError> {
		if self.objects.is_empty() && self.prefixes.is_empty() {
			return Err(TaskError::InvalidConfig("objects or prefixes must be set".into()));
		}
		if self.algorithms.is_empty() {
			return Err(TaskError::InvalidConfig("at least one hash algorithm is required".into()));
		}
		if self.page_size == 0 {
			return Err(TaskError::InvalidConfig("page_size must be positive".into()));
		}
		if self.sign_expires_secs == 0 {
			return Err(TaskError::InvalidConfig("sign_expires_secs must be positive".into()));
		}
		self.orchestrator.validate()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
	Physical,
	Logical,
	Wal,
}

impl BackupType {
	pub fn as_str(&self) -> &'static str {
		match self {
			BackupType::Physical => "physical",
			BackupType::Logical => "logical",
			BackupType::Wal => "wal",
		}
	}

	pub fn parse(value: &str) -> Option<Self> {
		match value {
			"physical" => Some(BackupType::Physical),
			"logical" => Some(BackupType::Logical),
			"wal" => Some(BackupType::Wal),
			_ => None,
		}
	}
}

fn default_backup_types() -> Vec<BackupType> {
	vec![BackupType::Physical, BackupType::Logical, BackupType::Wal]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresBackupConfig {
	pub instances: Vec<String>,
	#[serde(default = "default_backup_types")]
	pub backup_types: Vec<BackupType>,
	#[serde(default = "default_back_track_days")]
	pub back_track_days: u32,
	#[serde(default)]
	pub time_range: Option<TimeWindow>,
	#[serde(default = "default_page_size")]
	pub page_size: u32,
	pub target: TargetConfig,
	#[serde(default)]
	pub orchestrator: OrchestratorConfig,
}

impl PostgresBackupConfig {
	pub fn new(instances: Vec<String>, target: TargetConfig) -> Self {
		Self {
			instances,
			backup_types: default_backup_types(),
			back_track_days: default_back_track_days(),
			time_range: None,
			page_size: default_page_size(),
			target,
			orchestrator: OrchestratorConfig::default(),
		}
	}

	pub fn validate(&self) -> Result<(), TaskError> {
		if self.instances.is_empty() {
			return Err(TaskError::InvalidConfig("at least one database instance is required".into()));
		}
		if self.backup_types.is_empty() {
			return Err(TaskError::InvalidConfig("at least one backup type is required".into()));
		}
		if self.page_size == 0 {
			return Err(TaskError::InvalidConfig("page_size must be positive".into()));
		}
		self.target.validate()?;
		self.orchestrator.validate()
	}
}
