//! Error types for the postchan runtime.

use postchan_protocol::{RUNTIME_ERROR, TIMEOUT_ERROR};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the postchan runtime.
#[derive(Debug, Error)]
pub enum Error {
	/// A channel already covers the same endpoint and scope with an
	/// overlapping origin.
	#[error(
		"A channel is already bound to the same endpoint which overlaps with origin '{origin}' and has scope '{scope}'"
	)]
	DuplicateBinding { origin: String, scope: String },

	/// A handler is already registered for the method.
	#[error("method '{0}' is already bound")]
	DuplicateHandler(String),

	/// The request did not declare the callback being invoked.
	#[error("request supports no such callback '{0}'")]
	InvalidCallback(String),

	/// Protocol invariant broken (double completion, unexpected handshake).
	#[error("Protocol violation: {0}")]
	ProtocolViolation(String),

	/// Invalid argument provided to a constructor or method.
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	/// Error reply from the remote handler.
	#[error("{code}: {message}")]
	Remote { code: String, message: String },

	/// Outbound call exceeded its deadline.
	#[error("timeout ({timeout_ms}ms) exceeded on method '{method}'")]
	Timeout { method: String, timeout_ms: u64 },

	/// The channel was destroyed before the operation could finish.
	#[error("Channel destroyed")]
	ChannelDestroyed,

	/// The dispatcher has been shut down.
	#[error("Dispatcher shut down")]
	DispatcherClosed,

	/// Popup and relay URLs do not share an origin.
	#[error("invalid arguments: origin of url and relay_url must match")]
	OriginMismatch {
		url_origin: String,
		relay_origin: String,
	},

	/// The environment lacks the capabilities the handshake needs.
	#[error("unsupported browser")]
	Unsupported,

	/// The platform refused to open the popup.
	#[error("popup blocked")]
	PopupBlocked,

	/// No relay frame with a trusted origin was found in the opener.
	#[error("can't find relay frame")]
	RelayNotFound,

	/// The popup has no opener to talk to.
	#[error("window has no opener")]
	NoOpener,

	/// Error reported by the other side of a popup exchange.
	#[error("{0}")]
	Exchange(String),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Wire error code for errors delivered to a caller's error continuation.
	pub fn code(&self) -> Option<&str> {
		match self {
			Error::Remote { code, .. } => Some(code),
			Error::Timeout { .. } => Some(TIMEOUT_ERROR),
			_ => None,
		}
	}

	/// Message accompanying [`code`](Self::code).
	pub fn message(&self) -> Option<String> {
		match self {
			Error::Remote { message, .. } => Some(message.clone()),
			Error::Timeout { .. } => Some(self.to_string()),
			_ => None,
		}
	}

	/// Returns true if this is a timeout error.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout { .. })
	}

	/// Returns true for synchronous protocol misuse.
	pub fn is_protocol_violation(&self) -> bool {
		matches!(
			self,
			Error::DuplicateBinding { .. }
				| Error::DuplicateHandler(_)
				| Error::InvalidCallback(_)
				| Error::ProtocolViolation(_)
		)
	}
}

/// Failure returned by a bound handler.
///
/// Converted into a wire error reply and delivered to the caller as
/// [`Error::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
	pub code: String,
	pub message: String,
}

impl RemoteError {
	pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			code: code.into(),
			message: message.into(),
		}
	}

	/// Error with the generic `runtime_error` code.
	pub fn runtime(message: impl Into<String>) -> Self {
		Self::new(RUNTIME_ERROR, message)
	}
}

impl From<&str> for RemoteError {
	fn from(message: &str) -> Self {
		Self::runtime(message)
	}
}

impl From<String> for RemoteError {
	fn from(message: String) -> Self {
		Self::runtime(message)
	}
}

impl<C: Into<String>, M: Into<String>> From<(C, M)> for RemoteError {
	fn from((code, message): (C, M)) -> Self {
		Self::new(code, message)
	}
}

impl From<serde_json::Error> for RemoteError {
	fn from(err: serde_json::Error) -> Self {
		Self::runtime(err.to_string())
	}
}

impl From<Error> for RemoteError {
	fn from(err: Error) -> Self {
		match err {
			Error::Remote { code, message } => Self::new(code, message),
			other => match other.code() {
				Some(code) => Self::new(code, other.to_string()),
				None => Self::runtime(other.to_string()),
			},
		}
	}
}
