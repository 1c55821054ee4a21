use std::fmt;

use serde::{Deserialize, Serialize};

/// Host suffixes that identify a bucket endpoint.
const OBJECT_HOST_DOMAINS: [(&str, &str); 2] = [("myqcloud", "com"), ("tencentcos", "cn")];

/// A bucket/region/key triple in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
	pub bucket: String,
	pub region: String,
	pub key: String,
}

impl ObjectRef {
	pub fn new(bucket: impl Into<String>, region: impl Into<String>, key: impl Into<String>) -> Self {
		Self {
			bucket: bucket.into(),
			region: region.into(),
			key: key.into(),
		}
	}

	/// Parse a bucket endpoint URL (`https://<bucket>.cos.<region>.myqcloud.com/<key>`,
	/// the `cos-internal` and `tencentcos.cn` variants included).
	/// Returns `None` for hosts that are not bucket endpoints.
	pub fn from_url(url: &str) -> Option<Self> {
		let rest = url
			.strip_prefix("https://")
			.or_else(|| url.strip_prefix("http://"))?;
		let rest = strip_query(rest);
		let (host, path) = rest.split_once('/').unwrap_or((rest, ""));

		let parts: Vec<&str> = host.split('.').collect();
		if parts.len() != 5 || !matches!(parts[1], "cos" | "cos-internal") {
			return None;
		}
		if !OBJECT_HOST_DOMAINS.contains(&(parts[3], parts[4])) {
			return None;
		}

		let key = urlencoding::decode(path).ok()?.into_owned();
		Some(Self::new(parts[0], parts[2], key))
	}
}

impl fmt::Display for ObjectRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "cos://{}.{}/{}", self.bucket, self.region, self.key)
	}
}

/// Where a work item's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Locator {
	Url { url: String },
	Object(ObjectRef),
}

impl Locator {
	/// Human readable form, safe for logs.
	pub fn redacted(&self) -> String {
		match self {
			Locator::Url { url } => redact_url(url),
			Locator::Object(object) => object.to_string(),
		}
	}
}

fn strip_query(url: &str) -> &str {
	match url.find('?') {
		Some(idx) => &url[..idx],
		None => url,
	}
}

/// Drop the querystring of a URL. Signed URLs carry credentials there.
pub fn redact_url(url: &str) -> String {
	strip_query(url).to_string()
}

/// Whether the URL already carries a request signature.
pub fn is_signed_url(url: &str) -> bool {
	match url.split_once('?') {
		Some((_, query)) => query
			.split('&')
			.any(|pair| pair.starts_with("q-signature=") || pair == "q-signature"),
		None => false,
	}
}

/// Redact every URL embedded in free text (error messages, log lines).
pub fn redact_text(text: &str) -> String {
	if !text.contains("://") || !text.contains('?') {
		return text.to_string();
	}

	let mut out = String::with_capacity(text.len());
	let mut first = true;
	for token in text.split(' ') {
		if !first {
			out.push(' ');
		}
		first = false;
		if token.contains("://") {
			out.push_str(strip_query(token));
		} else {
			out.push_str(token);
		}
	}
	out
}
