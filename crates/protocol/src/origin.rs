//! Origin handling.
//!
//! An origin is `scheme://host[:port]`, lower-cased, with no path. Channels
//! accept either a concrete http(s) origin or the wildcard `*`.

use url::Url;

/// Wildcard origin matching any sender.
pub const ANY_ORIGIN: &str = "*";

/// Normalizes a channel origin.
///
/// Returns the wildcard unchanged, trims paths off http(s) URLs and returns
/// `None` for anything else.
pub fn normalize_origin(input: &str) -> Option<String> {
	if input == ANY_ORIGIN {
		return Some(ANY_ORIGIN.to_string());
	}
	let url = Url::parse(input).ok()?;
	if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
		return None;
	}
	Some(url.origin().ascii_serialization())
}

/// Extracts the origin of a URL, falling back to the input when it has none.
///
/// Two URLs are considered same-origin when their extracted origins compare
/// equal.
pub fn extract_origin(url: &str) -> String {
	normalize_origin(url)
		.filter(|o| o != ANY_ORIGIN)
		.unwrap_or_else(|| url.to_string())
}
