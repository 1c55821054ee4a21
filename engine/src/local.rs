//! Directory-backed object store and `file://` fetcher.
//!
//! Layout under the root:
//! - `<bucket>/<key>`: object bytes
//! - `.meta/<bucket>/<key>.json`: user metadata, tags, CRC64 and etag
//! - `.uploads/<upload id>/`: parts of unfinished multipart uploads

use std::{
	collections::BTreeMap,
	io,
	path::{Path, PathBuf},
	time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use relay_core::{
	models::{CRC64_HEADER, USER_META_PREFIX},
	ObjectMeta, ObjectRef, TaskError,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use ulid::Ulid;
use walkdir::WalkDir;

use crate::{
	checksum::Crc64Hasher,
	services::{ByteRange, ByteStream, CompletedPart, FetchResponse, ObjectPage, ObjectStore, ObjectSummary, UrlFetcher},
};

const META_DIR: &str = ".meta";
const UPLOADS_DIR: &str = ".uploads";
const READ_CHUNK: usize = 256 * 1024;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
	#[serde(default)]
	metadata: BTreeMap<String, String>,
	#[serde(default)]
	tags: BTreeMap<String, String>,
	crc64: Option<String>,
	etag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadManifest {
	bucket: String,
	key: String,
	metadata: BTreeMap<String, String>,
}

fn map_io_error(err: io::Error, path: &Path) -> TaskError {
	match err.kind() {
		io::ErrorKind::NotFound => TaskError::NotFound(path.display().to_string()),
		_ => TaskError::transient(format!("{}: {err}", path.display())),
	}
}

/// Object store rooted at a local directory. Regions are accepted and ignored.
#[derive(Debug, Clone)]
pub struct LocalStore {
	root: PathBuf,
}

impl LocalStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
		self.root.join(bucket).join(key)
	}

	fn sidecar_path(&self, bucket: &str, key: &str) -> PathBuf {
		self.root.join(META_DIR).join(bucket).join(format!("{key}.json"))
	}

	fn uploads_dir(&self) -> PathBuf {
		self.root.join(UPLOADS_DIR)
	}

	/// Ids of multipart uploads neither completed nor aborted.
	pub fn pending_uploads(&self) -> Vec<String> {
		let Ok(entries) = std::fs::read_dir(self.uploads_dir()) else {
			return Vec::new();
		};
		entries
			.filter_map(Result::ok)
			.filter(|e| e.path().is_dir())
			.map(|e| e.file_name().to_string_lossy().into_owned())
			.collect()
	}

	/// Store `bytes` directly, for seeding sources and fixtures.
	pub async fn write_object(
		&self,
		object: &ObjectRef,
		bytes: &[u8],
		metadata: BTreeMap<String, String>,
	) -> Result<ObjectMeta, TaskError> {
		let body = futures::stream::iter(vec![Ok::<_, TaskError>(bytes::Bytes::copy_from_slice(bytes))]).boxed();
		self.put_object(object, body, bytes.len() as u64, &metadata).await
	}

	/// Split an object path back into bucket and key, if it lives under the root.
	fn locate(&self, path: &Path) -> Option<(String, String)> {
		let rel = path.strip_prefix(&self.root).ok()?;
		let mut parts = rel.iter().map(|p| p.to_string_lossy().into_owned());
		let bucket = parts.next()?;
		if bucket.starts_with('.') {
			return None;
		}
		let key = parts.collect::<Vec<_>>().join("/");
		(!key.is_empty()).then_some((bucket, key))
	}

	async fn read_sidecar(&self, bucket: &str, key: &str) -> Result<Sidecar, TaskError> {
		let path = self.sidecar_path(bucket, key);
		match tokio::fs::read(&path).await {
			Ok(raw) => serde_json::from_slice(&raw)
				.map_err(|e| TaskError::Internal(format!("corrupt sidecar {}: {e}", path.display()))),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Sidecar::default()),
			Err(err) => Err(map_io_error(err, &path)),
		}
	}

	async fn write_sidecar(&self, bucket: &str, key: &str, sidecar: &Sidecar) -> Result<(), TaskError> {
		let path = self.sidecar_path(bucket, key);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|e| map_io_error(e, parent))?;
		}
		let raw = serde_json::to_vec_pretty(sidecar).map_err(|e| TaskError::Internal(e.to_string()))?;
		tokio::fs::write(&path, raw).await.map_err(|e| map_io_error(e, &path))
	}

	fn build_meta(content_length: u64, sidecar: &Sidecar) -> ObjectMeta {
		let mut headers = vec![("content-length".to_string(), content_length.to_string())];
		if let Some(crc) = &sidecar.crc64 {
			headers.push((CRC64_HEADER.to_string(), crc.clone()));
		}
		if let Some(etag) = &sidecar.etag {
			headers.push(("etag".to_string(), format!("\"{etag}\"")));
		}
		for (name, value) in &sidecar.metadata {
			headers.push((format!("{USER_META_PREFIX}{name}"), value.clone()));
		}
		ObjectMeta::from_headers(headers)
	}

	async fn object_len(&self, path: &Path) -> Result<u64, TaskError> {
		let meta = tokio::fs::metadata(path).await.map_err(|e| map_io_error(e, path))?;
		if !meta.is_file() {
			return Err(TaskError::NotFound(path.display().to_string()));
		}
		Ok(meta.len())
	}

	/// Drain `body` into `file`, returning the CRC64, an etag and the byte count.
	async fn write_body(
		file: &mut tokio::fs::File,
		path: &Path,
		mut body: ByteStream,
		crc: &mut Crc64Hasher,
		etag: &mut blake3::Hasher,
	) -> Result<u64, TaskError> {
		let mut written = 0u64;
		while let Some(chunk) = body.next().await {
			let chunk = chunk?;
			crc.update(&chunk);
			etag.update(&chunk);
			file.write_all(&chunk).await.map_err(|e| map_io_error(e, path))?;
			written += chunk.len() as u64;
		}
		file.flush().await.map_err(|e| map_io_error(e, path))?;
		Ok(written)
	}

	/// Move a finished temp file into place and record its sidecar.
	async fn commit(
		&self,
		object: &ObjectRef,
		tmp: &Path,
		len: u64,
		crc: Crc64Hasher,
		etag: blake3::Hasher,
		metadata: BTreeMap<String, String>,
	) -> Result<ObjectMeta, TaskError> {
		let dest = self.object_path(&object.bucket, &object.key);
		if let Some(parent) = dest.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|e| map_io_error(e, parent))?;
		}
		tokio::fs::rename(tmp, &dest).await.map_err(|e| map_io_error(e, &dest))?;

		let sidecar = Sidecar {
			metadata,
			tags: BTreeMap::new(),
			crc64: Some(crc.finalize()),
			etag: Some(etag.finalize().to_hex()[..32].to_string()),
		};
		self.write_sidecar(&object.bucket, &object.key, &sidecar).await?;
		Ok(Self::build_meta(len, &sidecar))
	}

	async fn temp_file(&self) -> Result<(PathBuf, tokio::fs::File), TaskError> {
		let dir = self.uploads_dir();
		tokio::fs::create_dir_all(&dir).await.map_err(|e| map_io_error(e, &dir))?;
		let path = dir.join(format!("put-{}.tmp", Ulid::new()));
		let file = tokio::fs::File::create(&path).await.map_err(|e| map_io_error(e, &path))?;
		Ok((path, file))
	}
}

/// Path of a `file://` URL, querystring dropped.
fn url_path(url: &str) -> Result<PathBuf, TaskError> {
	let rest = url
		.strip_prefix("file://")
		.ok_or_else(|| TaskError::InvalidConfig(format!("not a file url: {}", relay_core::redact_url(url))))?;
	let path = rest.split('?').next().unwrap_or(rest);
	Ok(PathBuf::from(path))
}

#[async_trait]
impl UrlFetcher for LocalStore {
	async fn fetch(&self, url: &str, range: Option<ByteRange>) -> Result<FetchResponse, TaskError> {
		let path = url_path(url)?;
		let total = self.object_len(&path).await?;

		let sidecar = match self.locate(&path) {
			Some((bucket, key)) => self.read_sidecar(&bucket, &key).await?,
			None => Sidecar::default(),
		};

		let (start, end) = match range {
			Some(range) if range.start >= total => {
				return Err(TaskError::RangeNotSatisfiable(format!(
					"{} (size {total})",
					path.display()
				)));
			}
			Some(range) => (range.start, range.end.min(total)),
			None => (0, total),
		};

		let mut file = tokio::fs::File::open(&path).await.map_err(|e| map_io_error(e, &path))?;
		file.seek(io::SeekFrom::Start(start)).await.map_err(|e| map_io_error(e, &path))?;

		let mut meta = Self::build_meta(end - start, &sidecar);
		if range.is_some() {
			let content_range = format!("bytes {}-{}/{total}", start, end.saturating_sub(1));
			meta.headers.insert("content-range".into(), content_range);
			meta.content_length = total;
		}

		let reader_path = path.clone();
		let body = ReaderStream::with_capacity(file.take(end - start), READ_CHUNK)
			.map(move |chunk| chunk.map_err(|e| map_io_error(e, &reader_path)))
			.boxed();

		Ok(FetchResponse { meta, body })
	}
}

#[async_trait]
impl ObjectStore for LocalStore {
	fn object_url(&self, object: &ObjectRef, sign: bool, expires: Duration) -> String {
		let path = self.object_path(&object.bucket, &object.key);
		let mut url = format!("file://{}", path.display());
		if sign {
			let now = chrono::Utc::now().timestamp();
			let until = now + expires.as_secs() as i64;
			url.push_str(&format!("?q-sign-algorithm=sha1&q-sign-time={now};{until}&q-signature=local"));
		}
		url
	}

	async fn head_object(&self, object: &ObjectRef) -> Result<ObjectMeta, TaskError> {
		let len = self.object_len(&self.object_path(&object.bucket, &object.key)).await?;
		let sidecar = self.read_sidecar(&object.bucket, &object.key).await?;
		Ok(Self::build_meta(len, &sidecar))
	}

	async fn put_object(
		&self,
		object: &ObjectRef,
		body: ByteStream,
		content_length: u64,
		metadata: &BTreeMap<String, String>,
	) -> Result<ObjectMeta, TaskError> {
		let (tmp, mut file) = self.temp_file().await?;
		let mut crc = Crc64Hasher::new();
		let mut etag = blake3::Hasher::new();

		let written = match Self::write_body(&mut file, &tmp, body, &mut crc, &mut etag).await {
			Ok(n) => n,
			Err(err) => {
				let _ = tokio::fs::remove_file(&tmp).await;
				return Err(err);
			}
		};
		drop(file);

		if written != content_length {
			let _ = tokio::fs::remove_file(&tmp).await;
			return Err(TaskError::transient(format!(
				"short body for {object}: expected {content_length} bytes, got {written}"
			)));
		}

		self.commit(object, &tmp, written, crc, etag, metadata.clone()).await
	}

	async fn create_multipart_upload(
		&self,
		object: &ObjectRef,
		metadata: &BTreeMap<String, String>,
	) -> Result<String, TaskError> {
		let upload_id = Ulid::new().to_string();
		let dir = self.uploads_dir().join(&upload_id);
		tokio::fs::create_dir_all(&dir).await.map_err(|e| map_io_error(e, &dir))?;

		let manifest = UploadManifest {
			bucket: object.bucket.clone(),
			key: object.key.clone(),
			metadata: metadata.clone(),
		};
		let raw = serde_json::to_vec(&manifest).map_err(|e| TaskError::Internal(e.to_string()))?;
		let path = dir.join("manifest.json");
		tokio::fs::write(&path, raw).await.map_err(|e| map_io_error(e, &path))?;
		Ok(upload_id)
	}

	async fn upload_part(
		&self,
		_object: &ObjectRef,
		upload_id: &str,
		part_number: u32,
		body: ByteStream,
		content_length: u64,
	) -> Result<String, TaskError> {
		let dir = self.uploads_dir().join(upload_id);
		if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
			return Err(TaskError::NotFound(format!("upload {upload_id}")));
		}

		let path = dir.join(format!("{part_number:05}.part"));
		let mut file = tokio::fs::File::create(&path).await.map_err(|e| map_io_error(e, &path))?;
		let mut crc = Crc64Hasher::new();
		let mut etag = blake3::Hasher::new();
		let written = Self::write_body(&mut file, &path, body, &mut crc, &mut etag).await?;

		if written != content_length {
			return Err(TaskError::transient(format!(
				"short part {part_number}: expected {content_length} bytes, got {written}"
			)));
		}
		Ok(etag.finalize().to_hex()[..32].to_string())
	}

	async fn complete_multipart_upload(
		&self,
		object: &ObjectRef,
		upload_id: &str,
		parts: &[CompletedPart],
	) -> Result<ObjectMeta, TaskError> {
		let dir = self.uploads_dir().join(upload_id);
		let manifest_path = dir.join("manifest.json");
		let raw = tokio::fs::read(&manifest_path)
			.await
			.map_err(|e| map_io_error(e, &manifest_path))?;
		let manifest: UploadManifest =
			serde_json::from_slice(&raw).map_err(|e| TaskError::Internal(format!("corrupt upload manifest: {e}")))?;

		let (tmp, mut out) = self.temp_file().await?;
		let mut crc = Crc64Hasher::new();
		let mut etag = blake3::Hasher::new();
		let mut total = 0u64;

		for part in parts {
			let path = dir.join(format!("{:05}.part", part.part_number));
			let mut file = tokio::fs::File::open(&path).await.map_err(|e| map_io_error(e, &path))?;
			let mut buf = vec![0u8; READ_CHUNK];
			loop {
				let n = file.read(&mut buf).await.map_err(|e| map_io_error(e, &path))?;
				if n == 0 {
					break;
				}
				crc.update(&buf[..n]);
				etag.update(&buf[..n]);
				out.write_all(&buf[..n]).await.map_err(|e| map_io_error(e, &tmp))?;
				total += n as u64;
			}
		}
		out.flush().await.map_err(|e| map_io_error(e, &tmp))?;
		drop(out);

		let meta = self.commit(object, &tmp, total, crc, etag, manifest.metadata).await?;
		tokio::fs::remove_dir_all(&dir).await.map_err(|e| map_io_error(e, &dir))?;
		tracing::debug!(object = %object, upload_id, parts = parts.len(), "multipart upload completed");
		Ok(meta)
	}

	async fn abort_multipart_upload(&self, _object: &ObjectRef, upload_id: &str) -> Result<(), TaskError> {
		let dir = self.uploads_dir().join(upload_id);
		match tokio::fs::remove_dir_all(&dir).await {
			Ok(()) => Ok(()),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(map_io_error(err, &dir)),
		}
	}

	async fn list_objects(
		&self,
		bucket: &str,
		_region: &str,
		prefix: &str,
		marker: Option<&str>,
		max_keys: u32,
	) -> Result<ObjectPage, TaskError> {
		let base = self.root.join(bucket);
		let prefix = prefix.to_string();
		let marker = marker.map(str::to_string);

		// Walk filesystem (blocking, offloaded)
		let mut keys = tokio::task::spawn_blocking(move || walk_bucket(&base, &prefix, marker.as_deref()))
			.await
			.map_err(|e| TaskError::Internal(format!("task join error: {e}")))??;

		let is_truncated = keys.len() > max_keys as usize;
		keys.truncate(max_keys as usize);
		let next_marker = if is_truncated { keys.last().map(|o| o.key.clone()) } else { None };

		Ok(ObjectPage {
			objects: keys,
			next_marker,
			is_truncated,
		})
	}

	async fn get_object_tagging(&self, object: &ObjectRef) -> Result<BTreeMap<String, String>, TaskError> {
		self.object_len(&self.object_path(&object.bucket, &object.key)).await?;
		Ok(self.read_sidecar(&object.bucket, &object.key).await?.tags)
	}

	async fn put_object_tagging(&self, object: &ObjectRef, tags: &BTreeMap<String, String>) -> Result<(), TaskError> {
		self.object_len(&self.object_path(&object.bucket, &object.key)).await?;
		let mut sidecar = self.read_sidecar(&object.bucket, &object.key).await?;
		sidecar.tags = tags.clone();
		self.write_sidecar(&object.bucket, &object.key, &sidecar).await
	}
}

/// Sorted keys under `base` matching `prefix` and strictly after `marker`.
fn walk_bucket(base: &Path, prefix: &str, marker: Option<&str>) -> Result<Vec<ObjectSummary>, TaskError> {
	if !base.exists() {
		return Ok(Vec::new());
	}

	let mut objects = Vec::new();
	for entry in WalkDir::new(base).follow_links(false) {
		let entry = entry.map_err(|e| TaskError::transient(format!("walk {}: {e}", base.display())))?;
		if !entry.file_type().is_file() {
			continue;
		}
		let Ok(rel) = entry.path().strip_prefix(base) else {
			continue;
		};
		let key = rel
			.iter()
			.map(|p| p.to_string_lossy())
			.collect::<Vec<_>>()
			.join("/");
		if !key.starts_with(prefix) || marker.is_some_and(|m| key.as_str() <= m) {
			continue;
		}
		let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
		objects.push(ObjectSummary { key, size, etag: None });
	}

	objects.sort_by(|a, b| a.key.cmp(&b.key));
	Ok(objects)
}
