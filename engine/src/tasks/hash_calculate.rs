use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use relay_core::{
	config::{HashAlgorithm, HashCalculateConfig, PrefixSource},
	redact_url, ChecksumMismatch, Locator, ObjectMeta, ObjectRef, TaskError, TaskOutcome, TaskParams, WorkItem,
	CHECKSUM_TRACE_ID,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::wrap_listing_error;
use crate::{
	cancel::guard_stream,
	checksum::Crc64Hasher,
	orchestrator::{BackupJob, JobContext},
	services::{ObjectStore, UrlFetcher},
};

const LIST_ACTION: &str = "GetBucket";

enum Hasher {
	Crc64(Crc64Hasher),
	Sha256(Sha256),
	Blake3(Box<blake3::Hasher>),
}

/// Feeds one pass over the bytes to every requested algorithm.
pub struct MultiHasher {
	hashers: Vec<(HashAlgorithm, Hasher)>,
	bytes: u64,
}

impl MultiHasher {
	pub fn new(algorithms: &[HashAlgorithm]) -> Self {
		let hashers = algorithms
			.iter()
			.map(|alg| {
				let hasher = match alg {
					HashAlgorithm::Crc64 => Hasher::Crc64(Crc64Hasher::new()),
					HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
					HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
				};
				(*alg, hasher)
			})
			.collect();
		Self { hashers, bytes: 0 }
	}

	pub fn update(&mut self, chunk: &[u8]) {
		self.bytes += chunk.len() as u64;
		for (_, hasher) in &mut self.hashers {
			match hasher {
				Hasher::Crc64(h) => h.update(chunk),
				Hasher::Sha256(h) => h.update(chunk),
				Hasher::Blake3(h) => {
					h.update(chunk);
				}
			}
		}
	}

	pub fn bytes(&self) -> u64 {
		self.bytes
	}

	/// CRC64 as a decimal string, the others as lowercase hex.
	pub fn finalize(self) -> BTreeMap<HashAlgorithm, String> {
		self.hashers
			.into_iter()
			.map(|(alg, hasher)| {
				let value = match hasher {
					Hasher::Crc64(h) => h.finalize(),
					Hasher::Sha256(h) => hex::encode(h.finalize()),
					Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
				};
				(alg, value)
			})
			.collect()
	}
}

/// Computes content hashes of existing objects and stores them as object tags.
pub struct HashCalculateJob {
	config: HashCalculateConfig,
	store: Arc<dyn ObjectStore>,
	fetcher: Arc<dyn UrlFetcher>,
	algorithms: Vec<HashAlgorithm>,
	sign_expires: Duration,
}

impl HashCalculateJob {
	pub const NAME: &'static str = "hash-calculate";

	pub fn new(config: HashCalculateConfig, store: Arc<dyn ObjectStore>, fetcher: Arc<dyn UrlFetcher>) -> Result<Self, TaskError> {
		config.validate()?;
		// CRC64 is always computed: it is what the server-side checksum is checked against.
		let mut algorithms = vec![HashAlgorithm::Crc64];
		for alg in &config.algorithms {
			if !algorithms.contains(alg) {
				algorithms.push(*alg);
			}
		}
		Ok(Self {
			sign_expires: Duration::from_secs(config.sign_expires_secs),
			config,
			store,
			fetcher,
			algorithms,
		})
	}

	async fn list_prefix(&self, source: &PrefixSource, ctx: &JobContext) -> Result<Vec<ObjectRef>, TaskError> {
		let mut objects = Vec::new();
		let mut marker: Option<String> = None;

		loop {
			let page = ctx
				.retry
				.run(Some(&ctx.scope), LIST_ACTION, |_| {
					self.store.list_objects(
						&source.bucket,
						&source.region,
						&source.prefix,
						marker.as_deref(),
						self.config.page_size,
					)
				})
				.await?;

			let last_key = page.objects.last().map(|o| o.key.clone());
			objects.extend(
				page.objects
					.into_iter()
					.filter(|o| !o.key.ends_with('/'))
					.map(|o| ObjectRef::new(&source.bucket, &source.region, o.key)),
			);

			if !page.is_truncated {
				break;
			}
			let next = page.next_marker.or(last_key);
			if next.is_none() || next == marker {
				break;
			}
			marker = next;
		}

		Ok(objects)
	}

	/// Stream the object once through every hasher. Retries restart from byte zero.
	async fn digest(&self, object: &ObjectRef, ctx: &JobContext) -> Result<(BTreeMap<HashAlgorithm, String>, u64), TaskError> {
		// Own scope in the registry so a cancel interrupts the read itself.
		let scope = ctx.scope.child();
		let _guard = ctx.registry.register(Arc::new(scope.clone()));
		let url = self.store.object_url(object, true, self.sign_expires);
		let fetcher = self.fetcher.as_ref();
		let algorithms = &self.algorithms;

		ctx.retry
			.run(Some(&scope), "hash_stream", |_| {
				let url = url.as_str();
				let scope = scope.clone();
				async move {
					let mut hasher = MultiHasher::new(algorithms);
					let body = match fetcher.fetch(url, None).await {
						Ok(resp) => resp.body,
						Err(TaskError::RangeNotSatisfiable(_)) => futures::stream::empty().boxed(),
						Err(err) => return Err(err),
					};
					let mut body = guard_stream(body, scope);
					while let Some(chunk) = body.next().await {
						hasher.update(&chunk?);
					}
					let bytes = hasher.bytes();
					Ok((hasher.finalize(), bytes))
				}
			})
			.await
	}
}

#[async_trait]
impl BackupJob for HashCalculateJob {
	fn name(&self) -> &str {
		Self::NAME
	}

	async fn enumerate(&self, ctx: &JobContext) -> Result<Vec<WorkItem>, TaskError> {
		let mut objects = self.config.objects.clone();
		for source in &self.config.prefixes {
			let listed = self
				.list_prefix(source, ctx)
				.await
				.map_err(|err| wrap_listing_error(&format!("{}/{}", source.bucket, source.prefix), LIST_ACTION, err))?;
			tracing::info!(bucket = %source.bucket, prefix = %source.prefix, objects = listed.len(), "prefix listed");
			objects.extend(listed);
		}

		Ok(objects
			.into_iter()
			.map(|object| WorkItem::new(object.key.clone(), Locator::Object(object)))
			.collect())
	}

	fn describe(&self, item: &WorkItem) -> TaskParams {
		TaskParams::from([
			("label".to_string(), item.label.clone()),
			("object".to_string(), item.locator.redacted()),
		])
	}

	async fn process(&self, item: WorkItem, ctx: &JobContext) -> Result<TaskOutcome, TaskError> {
		let Locator::Object(object) = &item.locator else {
			return Err(TaskError::InvalidConfig(format!("{} is not a bucket object", item.locator.redacted())));
		};

		// 1. Server view: length, CRC64 and the tags written by earlier runs
		let head = ctx
			.retry
			.run(Some(&ctx.scope), "HeadObject", |_| self.store.head_object(object))
			.await?;
		let tags = ctx
			.retry
			.run(Some(&ctx.scope), "GetObjectTagging", |_| self.store.get_object_tagging(object))
			.await?;

		// 2. Every hash already recorded, and nothing says the content changed since
		let complete = self.algorithms.iter().all(|alg| tags.contains_key(&alg.tag_key()));
		let stored_crc = tags.get(&HashAlgorithm::Crc64.tag_key());
		let unchanged = match (&head.crc64, stored_crc) {
			(Some(server), Some(stored)) => server == stored,
			(None, stored) => stored.is_some(),
			(Some(_), None) => false,
		};
		if complete && unchanged {
			return Ok(TaskOutcome::SameFileSkip);
		}

		// 3. One streamed pass through all hashers
		let (hashes, bytes) = self.digest(object, ctx).await?;

		// 4. The stream must match what the server says it stores
		let crc = hashes.get(&HashAlgorithm::Crc64).cloned();
		if head.crc64.is_some() && head.crc64 != crc {
			let url = redact_url(&self.store.object_url(object, false, Duration::ZERO));
			return Err(TaskError::ChecksumMismatch(Box::new(ChecksumMismatch {
				trace_id: CHECKSUM_TRACE_ID,
				source_url: url.clone(),
				target_url: url,
				source_meta: head,
				target_meta: ObjectMeta {
					content_length: bytes,
					crc64: crc,
					..ObjectMeta::default()
				},
			})));
		}

		// 5. Merge into the existing tag set
		let mut merged = tags;
		for (alg, value) in &hashes {
			merged.insert(alg.tag_key(), value.clone());
		}
		ctx.retry
			.run(Some(&ctx.scope), "PutObjectTagging", |_| self.store.put_object_tagging(object, &merged))
			.await?;

		let hashes: BTreeMap<&str, &String> = hashes.iter().map(|(alg, v)| (alg.as_str(), v)).collect();
		Ok(TaskOutcome::Completed(json!({
			"object": object.to_string(),
			"bytes": bytes,
			"hashes": hashes,
		})))
	}
}
