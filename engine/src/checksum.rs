//! CRC64 content comparison between a source and a target URL.

use std::sync::Arc;

use crc::{Crc, Digest, CRC_64_XZ};
use futures::StreamExt;
use relay_core::{redact_url, ChecksumMismatch, ObjectMeta, TaskError, CHECKSUM_TRACE_ID};

use crate::{
	cancel::{guard_stream, CancelScope},
	retry::RetryExecutor,
	services::{ByteRange, ByteStream, UrlFetcher},
};

/// CRC-64/ECMA-182 in the reflected form the object store reports in
/// `x-cos-hash-crc64ecma`.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Incremental CRC64 over streamed chunks.
pub struct Crc64Hasher {
	digest: Digest<'static, u64>,
}

impl Default for Crc64Hasher {
	fn default() -> Self {
		Self::new()
	}
}

impl Crc64Hasher {
	pub fn new() -> Self {
		Self { digest: CRC64.digest() }
	}

	pub fn update(&mut self, bytes: &[u8]) {
		self.digest.update(bytes);
	}

	/// Decimal string, the header's representation.
	pub fn finalize(self) -> String {
		self.digest.finalize().to_string()
	}
}

pub fn crc64_of(bytes: &[u8]) -> String {
	CRC64.checksum(bytes).to_string()
}

/// Consume a stream through the CRC64 transform. Returns the digest and byte count.
pub async fn crc64_stream(mut stream: ByteStream) -> Result<(String, u64), TaskError> {
	let mut hasher = Crc64Hasher::new();
	let mut total = 0u64;
	while let Some(chunk) = stream.next().await {
		let chunk = chunk?;
		total += chunk.len() as u64;
		hasher.update(&chunk);
	}
	Ok((hasher.finalize(), total))
}

/// Cheap metadata probe: a `bytes=0-0` request, falling back to a full GET
/// when the range cannot be satisfied (empty objects). The length of an
/// object answered that way is zero.
pub async fn probe_meta(
	fetcher: &dyn UrlFetcher,
	url: &str,
	retry: &RetryExecutor,
	scope: Option<&CancelScope>,
) -> Result<ObjectMeta, TaskError> {
	let probed = retry
		.run(scope, "probe_meta", |_| async move {
			fetcher.fetch(url, Some(ByteRange::new(0, 1))).await.map(|resp| resp.meta)
		})
		.await;

	match probed {
		Ok(meta) => Ok(meta),
		Err(TaskError::RangeNotSatisfiable(_)) => {
			let mut meta = retry
				.run(scope, "probe_meta_full", |_| async move {
					fetcher.fetch(url, None).await.map(|resp| resp.meta)
				})
				.await?;
			meta.content_length = 0;
			Ok(meta)
		}
		Err(err) => Err(err),
	}
}

/// Inputs of one comparison. Metadata that is already known skips the probe.
#[derive(Debug, Clone)]
pub struct CheckRequest<'a> {
	pub source: &'a str,
	pub target: &'a str,
	pub source_meta: Option<ObjectMeta>,
	pub target_meta: Option<ObjectMeta>,
	/// Report a mismatch (or any failure to compare) as `false` instead of an error.
	pub silent: bool,
}

#[derive(Clone)]
pub struct ChecksumVerifier {
	fetcher: Arc<dyn UrlFetcher>,
	retry: RetryExecutor,
}

impl ChecksumVerifier {
	pub fn new(fetcher: Arc<dyn UrlFetcher>, retry: RetryExecutor) -> Self {
		Self { fetcher, retry }
	}

	/// Whether source and target hold the same bytes.
	///
	/// With `silent` unset a mismatch is a [`TaskError::ChecksumMismatch`] carrying
	/// both redacted URLs and both metadata blobs. Cancellation always propagates.
	pub async fn check_file_same(&self, request: CheckRequest<'_>, scope: Option<&CancelScope>) -> Result<bool, TaskError> {
		let silent = request.silent;
		match self.compare(request, scope).await {
			Ok(None) => Ok(true),
			Ok(Some(mismatch)) if silent => {
				tracing::debug!(
					source = %mismatch.source_url,
					target = %mismatch.target_url,
					"checksum differs"
				);
				Ok(false)
			}
			Ok(Some(mismatch)) => Err(TaskError::ChecksumMismatch(Box::new(mismatch))),
			Err(err) if silent && !err.is_canceled() => {
				tracing::debug!(error = %err.clone().redacted(), "comparison unavailable, treating as different");
				Ok(false)
			}
			Err(err) => Err(err),
		}
	}

	async fn compare(&self, request: CheckRequest<'_>, scope: Option<&CancelScope>) -> Result<Option<ChecksumMismatch>, TaskError> {
		let mut source_meta = match request.source_meta {
			Some(meta) => meta,
			None => probe_meta(self.fetcher.as_ref(), request.source, &self.retry, scope).await?,
		};
		let mut target_meta = match request.target_meta {
			Some(meta) => meta,
			None => probe_meta(self.fetcher.as_ref(), request.target, &self.retry, scope).await?,
		};

		if source_meta.content_length == target_meta.content_length {
			if source_meta.crc64.is_none() {
				source_meta.crc64 = Some(self.digest(request.source, scope).await?);
			}
			if target_meta.crc64.is_none() {
				target_meta.crc64 = Some(self.digest(request.target, scope).await?);
			}
			if source_meta.crc64 == target_meta.crc64 {
				return Ok(None);
			}
		}

		Ok(Some(ChecksumMismatch {
			trace_id: CHECKSUM_TRACE_ID,
			source_url: redact_url(request.source),
			target_url: redact_url(request.target),
			source_meta,
			target_meta,
		}))
	}

	/// Stream the whole object through CRC64; nothing is buffered.
	async fn digest(&self, url: &str, scope: Option<&CancelScope>) -> Result<String, TaskError> {
		let fetcher = self.fetcher.as_ref();
		self.retry
			.run(scope, "crc64_stream", |_| async move {
				let body = match fetcher.fetch(url, None).await {
					Ok(resp) => resp.body,
					// Empty object: nothing to stream.
					Err(TaskError::RangeNotSatisfiable(_)) => return Ok(crc64_of(&[])),
					Err(err) => return Err(err),
				};
				let body = match scope {
					Some(scope) => guard_stream(body, scope.clone()),
					None => body,
				};
				crc64_stream(body).await.map(|(crc, _)| crc)
			})
			.await
	}
}
