//! Option structs for the popup handshake.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Window features requested for handshake popups.
pub const DEFAULT_POPUP_FEATURES: &str =
	"menubar=0,location=0,resizable=0,scrollbars=0,status=0,dialog=1,width=700,height=375";

/// Parameters of one popup exchange.
///
/// `url` and `relay_url` must share an origin; the relay URL is only loaded on
/// platforms that need a relay frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupOptions {
	/// Page loaded in the popup.
	pub url: String,

	/// Relay page served from the popup's origin.
	pub relay_url: String,

	/// Window features string passed to the popup opener.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub features: Option<String>,

	/// Payload delivered to the popup as the request.
	#[serde(default)]
	pub arg: Value,
}

impl PopupOptions {
	/// Creates options with [`DEFAULT_POPUP_FEATURES`] and a null argument.
	pub fn new(url: impl Into<String>, relay_url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			relay_url: relay_url.into(),
			features: Some(DEFAULT_POPUP_FEATURES.to_string()),
			arg: Value::Null,
		}
	}

	/// Sets the window features, `None` to let the platform decide.
	pub fn features(mut self, features: Option<String>) -> Self {
		self.features = features;
		self
	}

	/// Sets the request payload.
	pub fn arg(mut self, arg: Value) -> Self {
		self.arg = arg;
		self
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn builder_sets_fields() {
		let opts = PopupOptions::new("https://id.example/sign_in", "https://id.example/relay")
			.arg(json!({"method": "get"}))
			.features(None);
		assert_eq!(opts.features, None);
		assert_eq!(opts.arg["method"], "get");
	}

	#[test]
	fn deserializes_camel_case() {
		let opts: PopupOptions = serde_json::from_value(json!({
			"url": "https://id.example/sign_in",
			"relayUrl": "https://id.example/relay",
		}))
		.unwrap();
		assert_eq!(opts.relay_url, "https://id.example/relay");
		assert_eq!(opts.arg, Value::Null);
		assert_eq!(opts.features, None);
	}
}
