//! Verified copy of one work item: precheck, transfer, verify.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::FutureExt;
use relay_core::{models::PIPELINE_MARKER_KEY, redact_url, ObjectRef, TaskError, TaskOutcome, WorkItem};
use serde_json::json;

use crate::{
	checksum::{probe_meta, CheckRequest, ChecksumVerifier},
	orchestrator::JobContext,
	renewal::{spawn_renewal, SharedUrl},
	services::{ByteRange, ObjectStore, UrlFetcher, UrlResolver},
	transfer::{RangeStreamFactory, TransferRequest, TransferTask},
};

/// Where one item comes from and goes to.
pub struct CopyPlan {
	pub source_url: String,
	pub target: ObjectRef,
	/// Re-issues the source URL while the copy runs, for signed sources.
	pub resolver: Option<Arc<dyn UrlResolver>>,
	/// Remaining lifetime of `source_url`, when known.
	pub ttl: Option<Duration>,
}

impl CopyPlan {
	pub fn new(source_url: impl Into<String>, target: ObjectRef) -> Self {
		Self {
			source_url: source_url.into(),
			target,
			resolver: None,
			ttl: None,
		}
	}

	pub fn with_renewal(mut self, resolver: Arc<dyn UrlResolver>, ttl: Option<Duration>) -> Self {
		self.resolver = Some(resolver);
		self.ttl = ttl;
		self
	}
}

/// Copies URL sources into the destination store, shared by the copy jobs.
#[derive(Clone)]
pub struct Copier {
	fetcher: Arc<dyn UrlFetcher>,
	store: Arc<dyn ObjectStore>,
	pipeline: String,
	sign_expires: Duration,
}

impl Copier {
	pub fn new(fetcher: Arc<dyn UrlFetcher>, store: Arc<dyn ObjectStore>, pipeline: impl Into<String>, sign_expires: Duration) -> Self {
		Self {
			fetcher,
			store,
			pipeline: pipeline.into(),
			sign_expires,
		}
	}

	pub fn store(&self) -> &Arc<dyn ObjectStore> {
		&self.store
	}

	pub async fn copy_item(&self, item: &WorkItem, plan: CopyPlan, ctx: &JobContext) -> Result<TaskOutcome, TaskError> {
		let source = SharedUrl::new(plan.source_url);
		let target = plan.target;

		// 1. Keep a signed source fresh while we work on it
		let _renewal = plan.resolver.map(|resolver| {
			spawn_renewal(
				resolver,
				item.clone(),
				source.clone(),
				plan.ttl,
				ctx.config.renewal.clone(),
				ctx.scope.clone(),
			)
		});

		// 2. Source metadata (length, CRC64, pipeline marker)
		let source_meta = probe_meta(self.fetcher.as_ref(), &source.get(), &ctx.retry, Some(&ctx.scope)).await?;

		// 3. Cheap precheck against whatever is already at the target
		let verifier = ChecksumVerifier::new(self.fetcher.clone(), ctx.retry);
		let target_url = self.store.object_url(&target, true, self.sign_expires);
		let existing = match ctx
			.retry
			.run(Some(&ctx.scope), "head_object", |_| self.store.head_object(&target))
			.await
		{
			Ok(meta) => Some(meta),
			Err(TaskError::NotFound(_)) => None,
			Err(err) => return Err(err),
		};
		if let Some(target_meta) = existing {
			let same = verifier
				.check_file_same(
					CheckRequest {
						source: &source.get(),
						target: &target_url,
						source_meta: Some(source_meta.clone()),
						target_meta: Some(target_meta),
						silent: true,
					},
					Some(&ctx.scope),
				)
				.await?;
			if same {
				return Ok(TaskOutcome::SameFileSkip);
			}
		}

		// 4. Never feed this pipeline's own output back in as input
		if ctx.config.avoid_loop_risk && source_meta.pipeline_marker() == Some(self.pipeline.as_str()) {
			tracing::info!(item = %item.label, pipeline = %self.pipeline, "source was written by this pipeline, skipping");
			return Ok(TaskOutcome::LoopRiskSkip);
		}

		// 5. Transfer under its own registered scope
		let transfer = Arc::new(TransferTask::new(
			self.store.clone(),
			ctx.config.transfer.clone(),
			ctx.retry,
			ctx.scope.child(),
		));
		let guard = ctx.registry.register(transfer.clone());
		let factory: RangeStreamFactory = {
			let fetcher = self.fetcher.clone();
			let source = source.clone();
			Arc::new(move |range: Option<ByteRange>| {
				let fetcher = fetcher.clone();
				// Read at call time so a renewed URL is picked up.
				let url = source.get();
				async move { fetcher.fetch(&url, range).await.map(|resp| resp.body) }.boxed()
			})
		};
		let request = TransferRequest {
			target: target.clone(),
			content_length: source_meta.content_length,
			metadata: BTreeMap::from([(PIPELINE_MARKER_KEY.to_string(), self.pipeline.clone())]),
		};
		let output = transfer.run_task(request, factory).await;
		drop(guard);
		let output = output?;

		// 6. The copy only counts once the checksums agree
		verifier
			.check_file_same(
				CheckRequest {
					source: &source.get(),
					target: &target_url,
					source_meta: Some(source_meta),
					target_meta: None,
					silent: false,
				},
				Some(&ctx.scope),
			)
			.await?;

		Ok(TaskOutcome::Completed(json!({
			"sourceUrl": redact_url(&source.get()),
			"targetUrl": target.to_string(),
			"bytes": output.bytes,
			"parts": output.parts,
			"crc64": output.meta.crc64,
		})))
	}
}
