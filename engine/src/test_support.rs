//! In-memory fakes of the service traits for unit tests.

use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use relay_core::{
	config::BackupType,
	models::{CRC64_HEADER, USER_META_PREFIX},
	redact_url, ObjectMeta, ObjectRef, TaskError,
};

use crate::{
	checksum::crc64_of,
	services::{
		ByteRange, ByteStream, CdnLogRecord, CdnLogSource, CompletedPart, DbBackupRecord, DbBackupSource, FetchResponse, ListPage,
		ListQuery, ObjectPage, ObjectStore, SignedUrl, UrlFetcher,
	},
	transfer::RangeStreamFactory,
};

#[derive(Debug, Clone, Default)]
pub struct ObjectFixture {
	pub body: Bytes,
	pub headers: Vec<(String, String)>,
}

impl ObjectFixture {
	pub fn new(body: Vec<u8>) -> Self {
		Self {
			body: Bytes::from(body),
			headers: Vec::new(),
		}
	}

	/// Expose the server-side CRC64 header.
	pub fn with_crc64(mut self) -> Self {
		self.headers.push((CRC64_HEADER.to_string(), crc64_of(&self.body)));
		self
	}

	pub fn with_meta(mut self, name: &str, value: &str) -> Self {
		self.headers.push((format!("{USER_META_PREFIX}{name}"), value.to_string()));
		self
	}
}

#[derive(Default)]
struct FetcherState {
	objects: HashMap<String, ObjectFixture>,
	full_fetches: HashMap<String, usize>,
	attempts: HashMap<String, usize>,
	failures: HashMap<String, u32>,
}

/// URL fetcher over a map of fixtures. URLs are matched without their querystring.
#[derive(Default)]
pub struct MemoryFetcher {
	state: Mutex<FetcherState>,
}

impl MemoryFetcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, url: &str, fixture: ObjectFixture) {
		self.state.lock().objects.insert(redact_url(url), fixture);
	}

	/// Fail the next `times` fetches of `url` with a transient error.
	pub fn fail_next(&self, url: &str, times: u32) {
		self.state.lock().failures.insert(redact_url(url), times);
	}

	pub fn full_fetches(&self, url: &str) -> usize {
		self.state.lock().full_fetches.get(&redact_url(url)).copied().unwrap_or(0)
	}

	/// Every fetch of `url`, failed ones included.
	pub fn attempts(&self, url: &str) -> usize {
		self.state.lock().attempts.get(&redact_url(url)).copied().unwrap_or(0)
	}
}

#[async_trait]
impl UrlFetcher for MemoryFetcher {
	async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<FetchResponse, TaskError> {
		let key = redact_url(url);
		let mut state = self.state.lock();
		*state.attempts.entry(key.clone()).or_default() += 1;

		if let Some(left) = state.failures.get_mut(&key) {
			if *left > 0 {
				*left -= 1;
				return Err(TaskError::transient(format!("{url} connection reset")));
			}
		}

		let fixture = state
			.objects
			.get(&key)
			.cloned()
			.ok_or_else(|| TaskError::NotFound(key.clone()))?;
		let total = fixture.body.len() as u64;

		let mut headers = fixture.headers.clone();
		let body = match range {
			Some(range) if range.start >= total => {
				return Err(TaskError::RangeNotSatisfiable(key));
			}
			Some(range) => {
				let end = range.end.min(total);
				headers.push(("content-range".into(), format!("bytes {}-{}/{total}", range.start, end - 1)));
				headers.push(("content-length".into(), (end - range.start).to_string()));
				fixture.body.slice(range.start as usize..end as usize)
			}
			None => {
				*state.full_fetches.entry(key).or_default() += 1;
				headers.push(("content-length".into(), total.to_string()));
				fixture.body.clone()
			}
		};

		// Two chunks, so consumers really stream.
		let mid = body.len() / 2;
		let chunks: Vec<Result<Bytes, TaskError>> = vec![Ok(body.slice(..mid)), Ok(body.slice(mid..))];
		Ok(FetchResponse {
			meta: ObjectMeta::from_headers(headers),
			body: futures::stream::iter(chunks).boxed(),
		})
	}
}

/// Object store that passes everything to `inner`, altering what is switched on.
pub struct TamperingStore<S> {
	inner: Arc<S>,
	corrupt_puts: bool,
	hide_crc64: bool,
}

impl<S> TamperingStore<S> {
	pub fn new(inner: Arc<S>) -> Self {
		Self {
			inner,
			corrupt_puts: false,
			hide_crc64: false,
		}
	}

	/// Flip the first byte of every single-request upload, keeping its length.
	pub fn corrupting_puts(mut self) -> Self {
		self.corrupt_puts = true;
		self
	}

	/// Answer heads without the server-side CRC64.
	pub fn hiding_crc64(mut self) -> Self {
		self.hide_crc64 = true;
		self
	}
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for TamperingStore<S> {
	fn object_url(&self, object: &ObjectRef, sign: bool, expires: Duration) -> String {
		self.inner.object_url(object, sign, expires)
	}

	async fn head_object(&self, object: &ObjectRef) -> Result<ObjectMeta, TaskError> {
		let mut meta = self.inner.head_object(object).await?;
		if self.hide_crc64 {
			meta.crc64 = None;
			meta.headers.remove(CRC64_HEADER);
		}
		Ok(meta)
	}

	async fn put_object(
		&self,
		object: &ObjectRef,
		body: ByteStream,
		content_length: u64,
		metadata: &BTreeMap<String, String>,
	) -> Result<ObjectMeta, TaskError> {
		let body = if self.corrupt_puts {
			let mut untouched = true;
			body.map(move |chunk| {
				chunk.map(|bytes| {
					if untouched && !bytes.is_empty() {
						untouched = false;
						let mut flipped = bytes.to_vec();
						flipped[0] ^= 0xff;
						Bytes::from(flipped)
					} else {
						bytes
					}
				})
			})
			.boxed()
		} else {
			body
		};
		self.inner.put_object(object, body, content_length, metadata).await
	}

	async fn create_multipart_upload(&self, object: &ObjectRef, metadata: &BTreeMap<String, String>) -> Result<String, TaskError> {
		self.inner.create_multipart_upload(object, metadata).await
	}

	async fn upload_part(
		&self,
		object: &ObjectRef,
		upload_id: &str,
		part_number: u32,
		body: ByteStream,
		content_length: u64,
	) -> Result<String, TaskError> {
		self.inner.upload_part(object, upload_id, part_number, body, content_length).await
	}

	async fn complete_multipart_upload(
		&self,
		object: &ObjectRef,
		upload_id: &str,
		parts: &[CompletedPart],
	) -> Result<ObjectMeta, TaskError> {
		self.inner.complete_multipart_upload(object, upload_id, parts).await
	}

	async fn abort_multipart_upload(&self, object: &ObjectRef, upload_id: &str) -> Result<(), TaskError> {
		self.inner.abort_multipart_upload(object, upload_id).await
	}

	async fn list_objects(
		&self,
		bucket: &str,
		region: &str,
		prefix: &str,
		marker: Option<&str>,
		max_keys: u32,
	) -> Result<ObjectPage, TaskError> {
		self.inner.list_objects(bucket, region, prefix, marker, max_keys).await
	}

	async fn get_object_tagging(&self, object: &ObjectRef) -> Result<BTreeMap<String, String>, TaskError> {
		self.inner.get_object_tagging(object).await
	}

	async fn put_object_tagging(&self, object: &ObjectRef, tags: &BTreeMap<String, String>) -> Result<(), TaskError> {
		self.inner.put_object_tagging(object, tags).await
	}
}

/// Range factory over an in-memory body.
pub fn bytes_factory(body: Vec<u8>) -> RangeStreamFactory {
	let body = Bytes::from(body);
	Arc::new(move |range: Option<ByteRange>| {
		let len = body.len() as u64;
		let range = range.unwrap_or(ByteRange::new(0, len));
		let chunk = body.slice(range.start as usize..range.end.min(len) as usize);
		let stream: ByteStream = futures::stream::iter(vec![Ok::<_, TaskError>(chunk)]).boxed();
		futures::future::ready(Ok::<_, TaskError>(stream)).boxed()
	})
}

/// Listing source serving fixed records per scope, `page_calls` counts requests.
pub struct FakeListing<T> {
	pub records: HashMap<String, Vec<T>>,
	pub failing_scopes: Vec<String>,
	pub page_calls: Mutex<u32>,
	/// Reported total, when it should disagree with the real count.
	pub reported_total: Option<u64>,
}

impl<T> Default for FakeListing<T> {
	fn default() -> Self {
		Self {
			records: HashMap::new(),
			failing_scopes: Vec::new(),
			page_calls: Mutex::new(0),
			reported_total: None,
		}
	}
}

impl<T: Clone> FakeListing<T> {
	pub fn with(mut self, scope: &str, records: Vec<T>) -> Self {
		self.records.insert(scope.to_string(), records);
		self
	}

	fn page(&self, query: &ListQuery) -> Result<ListPage<T>, TaskError> {
		*self.page_calls.lock() += 1;
		if self.failing_scopes.contains(&query.scope) {
			return Err(TaskError::transient("InternalError.ServiceUnavailable"));
		}
		let all = self.records.get(&query.scope).cloned().unwrap_or_default();
		let start = (query.offset as usize).min(all.len());
		let end = (start + query.limit as usize).min(all.len());
		Ok(ListPage {
			total_count: self.reported_total.unwrap_or(all.len() as u64),
			items: all[start..end].to_vec(),
		})
	}
}

#[async_trait]
impl CdnLogSource for FakeListing<CdnLogRecord> {
	async fn list_logs(&self, query: &ListQuery) -> Result<ListPage<CdnLogRecord>, TaskError> {
		self.page(query)
	}
}

/// Database backups listed per `instance/type` scope; download URLs are
/// `<base>/<file_name>?sign=<n>` with an increasing `n`.
pub struct FakeBackups {
	pub listing: FakeListing<DbBackupRecord>,
	pub url_base: String,
	pub resolved: Mutex<u32>,
	pub ttl: chrono::Duration,
}

impl FakeBackups {
	pub fn new(url_base: &str) -> Self {
		Self {
			listing: FakeListing::default(),
			url_base: url_base.to_string(),
			resolved: Mutex::new(0),
			ttl: chrono::Duration::hours(1),
		}
	}

	pub fn scope(instance: &str, backup_type: BackupType) -> String {
		format!("{instance}/{}", backup_type.as_str())
	}
}

#[async_trait]
impl DbBackupSource for FakeBackups {
	async fn list_backups(&self, backup_type: BackupType, query: &ListQuery) -> Result<ListPage<DbBackupRecord>, TaskError> {
		let scoped = ListQuery {
			scope: Self::scope(&query.scope, backup_type),
			..query.clone()
		};
		self.listing.page(&scoped)
	}

	async fn resolve_download_url(&self, backup: &DbBackupRecord) -> Result<SignedUrl, TaskError> {
		let n = {
			let mut resolved = self.resolved.lock();
			*resolved += 1;
			*resolved
		};
		Ok(SignedUrl {
			url: format!("{}/{}?sign={n}", self.url_base, backup.file_name),
			expires_at: Some(chrono::Utc::now() + self.ttl),
		})
	}
}
