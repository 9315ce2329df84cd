//! Popup handshake messages.
//!
//! The exchange uses a two-field envelope, `{"a": verb, "d": data}`:
//!
//! 1. the popup signals it is listening with `{"a":"ready"}`
//! 2. the opener answers with `{"a":"request","d":arg}`
//! 3. the popup replies once with `{"a":"response","d":result}`
//! 4. either side may instead send `{"a":"error","d":message}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message posted by a popup that is closed before it answered.
pub const CLIENT_CLOSED_WINDOW: &str = "client closed window";

/// Name of the hidden relay frame the opener hosts on the relay path.
pub const RELAY_FRAME_NAME: &str = "_moz_vep_comm_iframe";

/// A popup handshake message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum WinChanMessage {
	Ready,
	Request(Value),
	Response(Value),
	Error(Value),
}

#[derive(Serialize, Deserialize)]
struct RawMessage {
	a: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	d: Option<Value>,
}

impl TryFrom<RawMessage> for WinChanMessage {
	type Error = String;

	fn try_from(raw: RawMessage) -> Result<Self, String> {
		let d = raw.d.unwrap_or(Value::Null);
		match raw.a.as_str() {
			"ready" => Ok(WinChanMessage::Ready),
			"request" => Ok(WinChanMessage::Request(d)),
			"response" => Ok(WinChanMessage::Response(d)),
			"error" => Ok(WinChanMessage::Error(d)),
			other => Err(format!("unknown verb '{other}'")),
		}
	}
}

impl From<WinChanMessage> for RawMessage {
	fn from(msg: WinChanMessage) -> Self {
		let (a, d) = match msg {
			WinChanMessage::Ready => ("ready", None),
			WinChanMessage::Request(d) => ("request", Some(d)),
			WinChanMessage::Response(d) => ("response", Some(d)),
			WinChanMessage::Error(d) => ("error", Some(d)),
		};
		RawMessage { a: a.to_string(), d }
	}
}

impl WinChanMessage {
	/// Builds an error message carrying plain text.
	pub fn error(message: impl Into<String>) -> Self {
		WinChanMessage::Error(Value::String(message.into()))
	}

	/// Parses a raw payload, returning `None` for anything unrecognized.
	pub fn parse(data: &str) -> Option<Self> {
		serde_json::from_str(data).ok()
	}

	/// Serializes the message to its wire string.
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}

/// Renders the data of an error message as text.
pub fn error_text(d: &Value) -> String {
	match d {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}
