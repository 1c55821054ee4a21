use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRC64_HEADER: &str = "x-cos-hash-crc64ecma";
pub const USER_META_PREFIX: &str = "x-cos-meta-";
/// User metadata name written onto every object this pipeline produces.
pub const PIPELINE_MARKER_KEY: &str = "relay-pipeline";
pub const PIPELINE_MARKER_HEADER: &str = "x-cos-meta-relay-pipeline";

/// Response headers of an object, with the fields the engine cares about lifted out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
	pub content_length: u64,
	pub crc64: Option<String>,
	pub etag: Option<String>,
	pub headers: BTreeMap<String, String>,
}

impl ObjectMeta {
	/// Build from raw response headers. The length is the `content-range` total
	/// when present (range probes), then `content-length`, then zero.
	pub fn from_headers<I, K, V>(headers: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: Into<String>,
	{
		let headers: BTreeMap<String, String> = headers
			.into_iter()
			.map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
			.collect();

		let content_length = headers
			.get("content-range")
			.and_then(|range| range.rsplit('/').next())
			.and_then(|total| total.trim().parse::<u64>().ok())
			.or_else(|| {
				headers
					.get("content-length")
					.and_then(|len| len.trim().parse::<u64>().ok())
			})
			.unwrap_or(0);

		let crc64 = headers.get(CRC64_HEADER).cloned().filter(|v| !v.is_empty());
		let etag = headers.get("etag").map(|v| v.trim_matches('"').to_string());

		Self {
			content_length,
			crc64,
			etag,
			headers,
		}
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
	}

	/// Name of the pipeline that produced this object, if any.
	pub fn pipeline_marker(&self) -> Option<&str> {
		self.header(PIPELINE_MARKER_HEADER)
	}

	/// User metadata with the `x-cos-meta-` prefix removed.
	pub fn user_metadata(&self) -> BTreeMap<String, String> {
		self.headers
			.iter()
			.filter_map(|(k, v)| k.strip_prefix(USER_META_PREFIX).map(|name| (name.to_string(), v.clone())))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn length_prefers_content_range_total() {
		let meta = ObjectMeta::from_headers([
			("Content-Range", "bytes 0-0/4096"),
			("Content-Length", "1"),
			("ETag", "\"abc\""),
			("x-cos-hash-crc64ecma", "1234"),
		]);
		assert_eq!(meta.content_length, 4096);
		assert_eq!(meta.etag.as_deref(), Some("abc"));
		assert_eq!(meta.crc64.as_deref(), Some("1234"));
	}

	#[test]
	fn length_falls_back_to_content_length_then_zero() {
		assert_eq!(ObjectMeta::from_headers([("content-length", "17")]).content_length, 17);
		assert_eq!(ObjectMeta::from_headers(Vec::<(String, String)>::new()).content_length, 0);
	}

	#[test]
	fn exposes_marker_and_user_metadata() {
		let meta = ObjectMeta::from_headers([
			("x-cos-meta-relay-pipeline", "cdn-log-backup"),
			("x-cos-meta-owner", "ops"),
		]);
		assert_eq!(meta.pipeline_marker(), Some("cdn-log-backup"));
		assert_eq!(meta.user_metadata().get("owner").map(String::as_str), Some("ops"));
	}
}
