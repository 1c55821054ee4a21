//! Narrow interfaces to the external services the engine drives.
//!
//! Listing APIs, signed-URL issuers and the object store are opaque
//! collaborators; only these traits are visible to the orchestration code.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use relay_core::{config::TimeWindow, ObjectMeta, ObjectRef, TaskError, WorkItem};

pub type ByteStream = BoxStream<'static, Result<Bytes, TaskError>>;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
	pub start: u64,
	pub end: u64,
}

impl ByteRange {
	pub fn new(start: u64, end: u64) -> Self {
		Self { start, end }
	}

	pub fn len(&self) -> u64 {
		self.end.saturating_sub(self.start)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

pub struct FetchResponse {
	pub meta: ObjectMeta,
	pub body: ByteStream,
}

/// GET over a URL, optionally ranged.
///
/// Implementations map a 416 response to [`TaskError::RangeNotSatisfiable`],
/// a 404 to [`TaskError::NotFound`] and network trouble to [`TaskError::Transient`].
#[async_trait]
pub trait UrlFetcher: Send + Sync {
	async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<FetchResponse, TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
	pub key: String,
	pub size: u64,
	pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
	pub objects: Vec<ObjectSummary>,
	pub next_marker: Option<String>,
	pub is_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
	pub part_number: u32,
	pub etag: String,
}

/// Destination object store. `metadata` maps are user metadata names without
/// the `x-cos-meta-` prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	fn object_url(&self, object: &ObjectRef, sign: bool, expires: Duration) -> String;

	async fn head_object(&self, object: &ObjectRef) -> Result<ObjectMeta, TaskError>;

	async fn put_object(
		&self,
		object: &ObjectRef,
		body: ByteStream,
		content_length: u64,
		metadata: &BTreeMap<String, String>,
	) -> Result<ObjectMeta, TaskError>;

	async fn create_multipart_upload(
		&self,
		object: &ObjectRef,
		metadata: &BTreeMap<String, String>,
	) -> Result<String, TaskError>;

	async fn upload_part(
		&self,
		object: &ObjectRef,
		upload_id: &str,
		part_number: u32,
		body: ByteStream,
		content_length: u64,
	) -> Result<String, TaskError>;

	async fn complete_multipart_upload(
		&self,
		object: &ObjectRef,
		upload_id: &str,
		parts: &[CompletedPart],
	) -> Result<ObjectMeta, TaskError>;

	async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<(), TaskError>;

	async fn list_objects(
		&self,
		bucket: &str,
		region: &str,
		prefix: &str,
		marker: Option<&str>,
		max_keys: u32,
	) -> Result<ObjectPage, TaskError>;

	async fn get_object_tagging(&self, object: &ObjectRef) -> Result<BTreeMap<String, String>, TaskError>;

	async fn put_object_tagging(&self, object: &ObjectRef, tags: &BTreeMap<String, String>) -> Result<(), TaskError>;
}

/// One page request against an offset-paginated listing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
	/// Domain, instance or other listing scope.
	pub scope: String,
	pub window: TimeWindow,
	pub offset: u64,
	pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage<T> {
	pub items: Vec<T>,
	pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnLogRecord {
	pub log_path: String,
	pub log_name: String,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub size: Option<u64>,
}

#[async_trait]
pub trait CdnLogSource: Send + Sync {
	async fn list_logs(&self, query: &ListQuery) -> Result<ListPage<CdnLogRecord>, TaskError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbBackupRecord {
	pub instance_id: String,
	pub backup_id: String,
	pub backup_type: relay_core::config::BackupType,
	pub file_name: String,
	pub size: Option<u64>,
	pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
	pub url: String,
	pub expires_at: Option<DateTime<Utc>>,
}

impl SignedUrl {
	/// Remaining lifetime, `None` when unknown or already expired.
	pub fn ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
		self.expires_at.and_then(|at| (at - now).to_std().ok())
	}
}

#[async_trait]
pub trait DbBackupSource: Send + Sync {
	async fn list_backups(
		&self,
		backup_type: relay_core::config::BackupType,
		query: &ListQuery,
	) -> Result<ListPage<DbBackupRecord>, TaskError>;

	async fn resolve_download_url(&self, backup: &DbBackupRecord) -> Result<SignedUrl, TaskError>;
}

/// Re-issues the signed source URL of a work item.
#[async_trait]
pub trait UrlResolver: Send + Sync {
	async fn resolve(&self, item: &WorkItem) -> Result<SignedUrl, TaskError>;
}
