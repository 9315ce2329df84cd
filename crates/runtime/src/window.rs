//! Window and frame collaborator consumed by the popup handshake.

use std::sync::Arc;

use crate::transport::{Endpoint, EndpointId, Listener, ListenerId};

/// Capability checks the handshake relies on.
///
/// Detecting these is the host's business; the runtime only reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
	/// Cross-context messaging and JSON are available at all.
	pub supported: bool,
	/// Direct popup to opener delivery is unreliable; broker it through a
	/// relay frame hosted by the opener.
	pub relay: bool,
	/// The platform misbehaves when popups are opened with feature strings.
	pub ignore_popup_features: bool,
}

impl Default for Capabilities {
	fn default() -> Self {
		Self {
			supported: true,
			relay: false,
			ignore_popup_features: false,
		}
	}
}

/// The local execution context.
pub trait Window: Send + Sync {
	/// Identity of this context as seen by others.
	fn id(&self) -> EndpointId;

	fn origin(&self) -> String;

	fn capabilities(&self) -> Capabilities;

	/// Subscribes to messages delivered to, and unload of, this context.
	fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId;

	fn remove_listener(&self, id: ListenerId);

	/// Opens a popup, `None` if the platform refused.
	fn open_popup(&self, url: &str, features: Option<&str>) -> Option<Arc<dyn Endpoint>>;

	/// Inserts a hidden frame loading `url` under `name`.
	fn create_relay_frame(&self, url: &str, name: &str) -> Option<Arc<dyn RelayFrame>>;

	/// Handle to the window that opened this one.
	fn opener(&self) -> Option<Arc<dyn Endpoint>>;

	/// Frames hosted by the opener, as visible from this context.
	fn opener_frames(&self) -> Vec<Arc<dyn RelayFrame>>;

	/// Queues `task` on this context's event loop. It must not run before
	/// the current call returns.
	fn defer(&self, task: Box<dyn FnOnce() + Send>);

	/// Closes this context.
	fn close(&self);
}

/// Hidden same-origin-as-target frame brokering popup traffic.
pub trait RelayFrame: Send + Sync {
	fn name(&self) -> String;

	/// Origin of the frame's document, `None` if it is not readable from the
	/// viewing context.
	fn origin(&self) -> Option<String>;

	/// Handle the hosting window uses to post into the frame.
	fn endpoint(&self) -> Arc<dyn Endpoint>;

	/// Posts from the frame to its hosting window. Called directly by
	/// same-origin contexts, bypassing their own unreliable delivery path.
	fn do_post(&self, data: String, target_origin: &str);

	/// Subscribes to messages delivered to the frame.
	fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId;

	fn remove_listener(&self, id: ListenerId);

	/// Detaches the frame from its hosting window.
	fn remove(&self);
}
