//! Message transport collaborator.
//!
//! The transport moves opaque string payloads between two execution
//! contexts. Delivery is asynchronous, tagged with the sender's origin, and
//! silently stops once the receiving context is gone.
//!
//! Implementations must not deliver inline from [`Endpoint::post`]: the
//! channel posts while holding its own state lock to keep queue order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of an execution context (window, frame, worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ctx#{}", self.0)
	}
}

/// A delivered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
	/// Raw payload as posted.
	pub data: String,
	/// Context that posted the payload.
	pub source: EndpointId,
	/// Origin of the posting context.
	pub origin: String,
}

/// Handle to another context that messages can be posted to.
pub trait Endpoint: Send + Sync {
	/// Identity of the context this handle points at.
	fn id(&self) -> EndpointId;

	/// Posts `data` to the context if its origin matches `target_origin`
	/// (`"*"` matches any origin).
	fn post(&self, data: String, target_origin: &str);

	/// Closes the context, if this handle is allowed to.
	fn close(&self) {}

	/// Brings the context to the foreground, if it has one.
	fn focus(&self) {}
}

/// Identifier of a registered [`Listener`].
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a new process-wide listener id.
pub fn next_listener_id() -> ListenerId {
	NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst)
}

/// Receiver of events of one context.
pub trait Listener: Send + Sync {
	/// A payload arrived.
	fn on_message(&self, envelope: &Envelope);

	/// The context is being torn down.
	fn on_unload(&self) {}
}
