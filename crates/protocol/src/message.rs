//! Channel protocol messages.
//!
//! Every message is a JSON object. Its kind is not tagged explicitly, it is
//! inferred from which fields are present:
//!
//! | Kind | Fields |
//! |---|---|
//! | [`Request`] | `id`, `method`, `params?`, `callbacks?` |
//! | [`Notification`] | `method`, `params?` |
//! | [`Callback`] | `id`, `callback`, `params?` |
//! | [`ErrorReply`] | `id`, `error`, `message?` |
//! | [`Response`] | `id`, `result?` |
//!
//! Methods may carry a scope prefix (`"scope::method"`) so several independent
//! protocols can share one transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between a scope and a method name on the wire.
pub const SCOPE_SEPARATOR: &str = "::";

/// Control method reserved by every channel for the ready handshake.
pub const READY_METHOD: &str = "__ready";

/// Params of the handshake notification that opens the exchange.
pub const READY_PING: &str = "ping";

/// Params of the handshake notification that answers a ping.
pub const READY_PONG: &str = "pong";

/// Error code used when a handler fails with a bare message.
pub const RUNTIME_ERROR: &str = "runtime_error";

/// Error code used when an outbound call exceeds its deadline.
pub const TIMEOUT_ERROR: &str = "timeout_error";

/// Outbound call expecting a [`Response`] or [`ErrorReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
	pub id: u64,
	pub method: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
	/// Callback paths the receiver may invoke while the request is open.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub callbacks: Option<Vec<String>>,
}

/// Fire-and-forget message; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
	pub method: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

/// Invocation of a callback declared by the request with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
	pub id: u64,
	pub callback: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

/// Terminal failure of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
	pub id: u64,
	pub error: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

/// Terminal success of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
}

/// Discriminated union of channel messages.
///
/// Serialization is untagged. Parsing goes through [`Message::parse`], which
/// picks the kind from the fields present before deserializing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
	Request(Request),
	Notification(Notification),
	Callback(Callback),
	Error(ErrorReply),
	Response(Response),
}

impl Message {
	/// Parses a raw payload.
	///
	/// The kind is chosen by key presence: `method` (a request when `id` is
	/// also present, else a notification), then `callback`, then `error`, then
	/// a bare `id`. Only that kind is deserialized; a payload whose fields do
	/// not fit it yields `None` instead of falling through to another kind.
	/// Such payloads are dropped by the dispatcher without surfacing an error.
	pub fn parse(data: &str) -> Option<Message> {
		let value: Value = serde_json::from_str(data).ok()?;
		let object = value.as_object()?;
		let has = |key: &str| object.contains_key(key);
		let (method, id, callback, error) = (has("method"), has("id"), has("callback"), has("error"));

		if method && id {
			serde_json::from_value(value).ok().map(Message::Request)
		} else if method {
			serde_json::from_value(value).ok().map(Message::Notification)
		} else if callback {
			serde_json::from_value(value).ok().map(Message::Callback)
		} else if error {
			serde_json::from_value(value).ok().map(Message::Error)
		} else if id {
			serde_json::from_value(value).ok().map(Message::Response)
		} else {
			None
		}
	}

	/// Serializes the message to its wire string.
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	/// Transaction id, absent for notifications.
	pub fn id(&self) -> Option<u64> {
		match self {
			Message::Request(r) => Some(r.id),
			Message::Callback(c) => Some(c.id),
			Message::Error(e) => Some(e.id),
			Message::Response(r) => Some(r.id),
			Message::Notification(_) => None,
		}
	}

	/// Full (possibly scoped) method name of requests and notifications.
	pub fn method(&self) -> Option<&str> {
		match self {
			Message::Request(r) => Some(&r.method),
			Message::Notification(n) => Some(&n.method),
			_ => None,
		}
	}
}

/// Prefixes `method` with `scope` unless the scope is empty.
pub fn scoped_method(scope: &str, method: &str) -> String {
	if scope.is_empty() {
		method.to_string()
	} else {
		format!("{scope}{SCOPE_SEPARATOR}{method}")
	}
}

/// Splits a wire method into `(scope, method)` at the first separator.
///
/// Unscoped methods yield an empty scope.
pub fn split_scope(method: &str) -> (&str, &str) {
	method.split_once(SCOPE_SEPARATOR).unwrap_or(("", method))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn classifies_by_field_presence() {
		let request = Message::parse(r#"{"id":1,"method":"s::echo","params":{"v":5}}"#).unwrap();
		assert!(matches!(request, Message::Request(ref r) if r.id == 1 && r.method == "s::echo"));

		let notification = Message::parse(r#"{"method":"ping"}"#).unwrap();
		assert!(matches!(notification, Message::Notification(_)));

		let callback = Message::parse(r#"{"id":3,"callback":"onProgress","params":{"pct":50}}"#).unwrap();
		assert!(matches!(callback, Message::Callback(ref c) if c.callback == "onProgress"));

		let error = Message::parse(r#"{"id":4,"error":"runtime_error","message":"bad"}"#).unwrap();
		assert!(matches!(error, Message::Error(ref e) if e.message.as_deref() == Some("bad")));

		let response = Message::parse(r#"{"id":5}"#).unwrap();
		assert!(matches!(response, Message::Response(Response { id: 5, result: None })));
	}

	#[test]
	fn rejects_malformed_payloads() {
		assert!(Message::parse("not json").is_none());
		assert!(Message::parse("42").is_none());
		assert!(Message::parse("null").is_none());
		assert!(Message::parse(r#"[1, "echo"]"#).is_none());
		assert!(Message::parse(r#"{"foo":"bar"}"#).is_none());
	}

	#[test]
	fn ill_typed_fields_do_not_fall_through() {
		// an error reply with a structured message is not a response
		assert!(Message::parse(r#"{"id":1,"error":"not_found","message":{"detail":"x"}}"#).is_none());
		assert!(Message::parse(r#"{"id":1,"error":42}"#).is_none());
		// a request with bad callbacks is not a notification
		assert!(Message::parse(r#"{"id":1,"method":"m","callbacks":"x"}"#).is_none());
		assert!(Message::parse(r#"{"id":"one","method":"m"}"#).is_none());
		assert!(Message::parse(r#"{"id":1,"callback":7}"#).is_none());
		assert!(Message::parse(r#"{"method":3}"#).is_none());
	}

	#[test]
	fn request_omits_absent_fields() {
		let msg = Message::Request(Request {
			id: 7,
			method: "echo".into(),
			params: None,
			callbacks: None,
		});
		assert_eq!(msg.to_json().unwrap(), r#"{"id":7,"method":"echo"}"#);
	}

	#[test]
	fn request_with_callbacks_serializes_paths() {
		let msg = Message::Request(Request {
			id: 9,
			method: "upload".into(),
			params: Some(json!({"file": "a.txt"})),
			callbacks: Some(vec!["progress/onTick".into()]),
		});
		let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
		assert_eq!(value["callbacks"], json!(["progress/onTick"]));
	}

	#[test]
	fn id_and_method_accessors() {
		let n = Message::Notification(Notification {
			method: "a::b".into(),
			params: None,
		});
		assert_eq!(n.id(), None);
		assert_eq!(n.method(), Some("a::b"));

		let r = Message::Response(Response { id: 2, result: None });
		assert_eq!(r.id(), Some(2));
		assert_eq!(r.method(), None);
	}

	#[test]
	fn scope_helpers() {
		assert_eq!(scoped_method("", "echo"), "echo");
		assert_eq!(scoped_method("auth", "echo"), "auth::echo");
		assert_eq!(split_scope("auth::echo"), ("auth", "echo"));
		assert_eq!(split_scope("echo"), ("", "echo"));
		assert_eq!(split_scope("a::b::c"), ("a", "b::c"));
	}
}
