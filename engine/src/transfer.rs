//! Streaming upload of one source into the destination store.

use std::{collections::BTreeMap, sync::Arc};

use futures::{future::BoxFuture, StreamExt, TryStreamExt};
use relay_core::{config::TransferConfig, ObjectMeta, ObjectRef, TaskError};

use crate::{
	cancel::{guard_stream, CancelScope},
	registry::Cancelable,
	retry::RetryExecutor,
	services::{ByteRange, ByteStream, CompletedPart, ObjectStore},
};

/// Opens a fresh body for a byte range of the source (`None` = whole object).
/// Called again for every retry so no body is ever replayed from memory.
pub type RangeStreamFactory =
	Arc<dyn Fn(Option<ByteRange>) -> BoxFuture<'static, Result<ByteStream, TaskError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransferRequest {
	pub target: ObjectRef,
	pub content_length: u64,
	/// User metadata written onto the target.
	pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TransferOutput {
	pub meta: ObjectMeta,
	pub bytes: u64,
	/// Zero for a single put.
	pub parts: u32,
}

/// A cancellable upload: single put for small objects, multipart with
/// bounded part concurrency otherwise.
pub struct TransferTask {
	store: Arc<dyn ObjectStore>,
	config: TransferConfig,
	retry: RetryExecutor,
	scope: CancelScope,
}

impl TransferTask {
	pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig, retry: RetryExecutor, scope: CancelScope) -> Self {
		Self {
			store,
			config,
			retry,
			scope,
		}
	}

	pub fn scope(&self) -> &CancelScope {
		&self.scope
	}

	pub async fn run_task(&self, request: TransferRequest, source: RangeStreamFactory) -> Result<TransferOutput, TaskError> {
		self.scope.check()?;

		if request.content_length <= self.config.part_size {
			let meta = self.put_single(&request, &source).await?;
			tracing::debug!(target = %request.target, bytes = request.content_length, "single put complete");
			return Ok(TransferOutput {
				meta,
				bytes: request.content_length,
				parts: 0,
			});
		}

		self.put_multipart(&request, &source).await
	}

	async fn put_single(&self, request: &TransferRequest, source: &RangeStreamFactory) -> Result<ObjectMeta, TaskError> {
		let store = self.store.as_ref();
		let scope = &self.scope;
		self.retry
			.run(Some(scope), "put_object", |_| {
				let source = source.clone();
				async move {
					let body = guard_stream(source(None).await?, scope.clone());
					store
						.put_object(&request.target, body, request.content_length, &request.metadata)
						.await
				}
			})
			.await
	}

	async fn put_multipart(&self, request: &TransferRequest, source: &RangeStreamFactory) -> Result<TransferOutput, TaskError> {
		let store = self.store.as_ref();
		let target = &request.target;

		let upload_id = self
			.retry
			.run(Some(&self.scope), "create_multipart_upload", |_| async move {
				store.create_multipart_upload(target, &request.metadata).await
			})
			.await?;

		let part_size = self.config.part_size;
		let part_count = request.content_length.div_ceil(part_size);
		tracing::debug!(target = %target, upload_id = %upload_id, parts = part_count, "multipart upload started");

		let uploads = futures::stream::iter(1..=part_count)
			.map(|n| {
				let start = (n - 1) * part_size;
				let range = ByteRange::new(start, (start + part_size).min(request.content_length));
				self.upload_part(target, &upload_id, n as u32, range, source)
			})
			.buffered(self.config.part_concurrency)
			.try_collect::<Vec<CompletedPart>>();

		let parts = tokio::select! {
			biased;
			_ = self.scope.cancelled() => Err(self.scope.error()),
			parts = uploads => parts,
		};

		let completed = match parts {
			Ok(parts) => {
				let parts = &parts;
				let upload_id = upload_id.as_str();
				self.retry
					.run(Some(&self.scope), "complete_multipart_upload", |_| async move {
						store.complete_multipart_upload(target, upload_id, parts).await
					})
					.await
			}
			Err(err) => Err(err),
		};

		match completed {
			Ok(meta) => Ok(TransferOutput {
				meta,
				bytes: request.content_length,
				parts: part_count as u32,
			}),
			Err(err) => {
				if let Err(abort_err) = store.abort_multipart_upload(target, &upload_id).await {
					tracing::warn!(target = %target, upload_id = %upload_id, error = %abort_err.redacted(), "abort multipart upload failed");
				}
				Err(err)
			}
		}
	}

	async fn upload_part(
		&self,
		target: &ObjectRef,
		upload_id: &str,
		part_number: u32,
		range: ByteRange,
		source: &RangeStreamFactory,
	) -> Result<CompletedPart, TaskError> {
		let store = self.store.as_ref();
		let scope = &self.scope;
		let etag = self
			.retry
			.run(Some(scope), "upload_part", |_| {
				let source = source.clone();
				async move {
					let body = guard_stream(source(Some(range)).await?, scope.clone());
					store.upload_part(target, upload_id, part_number, body, range.len()).await
				}
			})
			.await?;
		Ok(CompletedPart { part_number, etag })
	}
}

impl Cancelable for TransferTask {
	fn cancel(&self, reason: &TaskError) -> Result<(), TaskError> {
		self.scope.cancel(reason.clone());
		Ok(())
	}
}
