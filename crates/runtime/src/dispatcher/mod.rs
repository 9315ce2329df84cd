//! Inbound dispatcher: channel registry and transaction table.
//!
//! One dispatcher serves every channel of an execution context. It parses
//! each inbound payload once and routes it:
//!
//! - requests and notifications (payloads carrying `method`) through the
//!   registry, keyed by origin and scope and disambiguated by the sending
//!   endpoint;
//! - responses, errors and callback invocations (payloads carrying only `id`)
//!   through the transaction table, keyed by transaction id.
//!
//! # Binding rule
//!
//! No two bound routes may share endpoint and scope with overlapping origins.
//! Two exact origins overlap when equal; the wildcard overlaps everything.
//! This keeps routing unambiguous: at most one route receives each message.
//!
//! The dispatcher never reports errors outward from [`Dispatcher::dispatch`].
//! Malformed payloads and unroutable messages are dropped with a debug log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use postchan_protocol::{ANY_ORIGIN, Message, split_scope};

use crate::error::{Error, Result};
use crate::transport::{Envelope, EndpointId, Listener, ListenerId};
use crate::window::Window;

/// Receiver of routed messages, implemented by channels.
pub trait Route: Send + Sync {
	/// Handles a routed message. `method` is the unscoped method name for
	/// requests and notifications, `None` for id-routed messages.
	fn deliver(&self, envelope: &Envelope, method: Option<&str>, message: Message);

	/// The dispatcher is shutting down and has forgotten this route.
	fn shutdown(&self) {}
}

struct BoundEntry {
	endpoint: EndpointId,
	route: Arc<dyn Route>,
}

/// origin -> scope -> bound entries
type Registry = HashMap<String, HashMap<String, Vec<BoundEntry>>>;

struct Attachment {
	window: Arc<dyn Window>,
	listener: ListenerId,
}

struct DispatcherInner {
	next_id: AtomicU64,
	bound: Mutex<Registry>,
	transactions: DashMap<u64, Arc<dyn Route>>,
	closed: AtomicBool,
	local: Option<EndpointId>,
	attachment: Mutex<Option<Attachment>>,
}

/// Per-context registry and transaction table.
///
/// Cloning yields another handle to the same tables.
#[derive(Clone)]
pub struct Dispatcher {
	inner: Arc<DispatcherInner>,
}

impl Default for Dispatcher {
	fn default() -> Self {
		Self::new()
	}
}

impl Dispatcher {
	/// Creates a dispatcher fed manually through [`dispatch`](Self::dispatch).
	pub fn new() -> Self {
		Self::with_local(None)
	}

	/// Creates a dispatcher listening to every message delivered to `window`.
	///
	/// Channels built on it may not target the window itself.
	pub fn attach(window: &Arc<dyn Window>) -> Self {
		let dispatcher = Self::with_local(Some(window.id()));
		let listener = window.add_listener(Arc::new(dispatcher.clone()));
		*dispatcher.inner.attachment.lock() = Some(Attachment {
			window: Arc::clone(window),
			listener,
		});
		tracing::debug!(window = %window.id(), "dispatcher attached");
		dispatcher
	}

	fn with_local(local: Option<EndpointId>) -> Self {
		Self {
			inner: Arc::new(DispatcherInner {
				next_id: AtomicU64::new(1),
				bound: Mutex::new(HashMap::new()),
				transactions: DashMap::new(),
				closed: AtomicBool::new(false),
				local,
				attachment: Mutex::new(None),
			}),
		}
	}

	/// Endpoint id of the window this dispatcher is attached to.
	pub fn local_endpoint(&self) -> Option<EndpointId> {
		self.inner.local
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Binds a route, enforcing the origin overlap rule.
	pub fn register(
		&self,
		endpoint: EndpointId,
		origin: &str,
		scope: &str,
		route: Arc<dyn Route>,
	) -> Result<()> {
		if self.is_closed() {
			return Err(Error::DispatcherClosed);
		}

		let mut bound = self.inner.bound.lock();
		let has_endpoint = |entries: Option<&Vec<BoundEntry>>| {
			entries.is_some_and(|entries| entries.iter().any(|e| e.endpoint == endpoint))
		};

		let exists = if origin == ANY_ORIGIN {
			bound.values().any(|scopes| has_endpoint(scopes.get(scope)))
		} else {
			has_endpoint(bound.get(ANY_ORIGIN).and_then(|s| s.get(scope)))
				|| has_endpoint(bound.get(origin).and_then(|s| s.get(scope)))
		};

		if exists {
			return Err(Error::DuplicateBinding {
				origin: origin.to_string(),
				scope: scope.to_string(),
			});
		}

		bound
			.entry(origin.to_string())
			.or_default()
			.entry(scope.to_string())
			.or_default()
			.push(BoundEntry { endpoint, route });

		tracing::debug!(%endpoint, origin, scope, "route bound");
		Ok(())
	}

	/// Removes the route bound for `endpoint` under `origin` and `scope`.
	pub fn unregister(&self, endpoint: EndpointId, origin: &str, scope: &str) {
		let mut bound = self.inner.bound.lock();
		let Some(scopes) = bound.get_mut(origin) else {
			return;
		};
		if let Some(entries) = scopes.get_mut(scope) {
			entries.retain(|e| e.endpoint != endpoint);
			if entries.is_empty() {
				scopes.remove(scope);
			}
		}
		if scopes.is_empty() {
			bound.remove(origin);
		}
	}

	/// Number of bound routes.
	pub fn bound_count(&self) -> usize {
		self.inner
			.bound
			.lock()
			.values()
			.flat_map(|scopes| scopes.values())
			.map(Vec::len)
			.sum()
	}

	/// Allocates a transaction id unique among this dispatcher's calls.
	pub fn allocate_id(&self) -> u64 {
		self.inner.next_id.fetch_add(1, Ordering::SeqCst)
	}

	/// Routes id-addressed replies for `id` to `route`.
	pub fn track(&self, id: u64, route: Arc<dyn Route>) {
		if self.is_closed() {
			return;
		}
		self.inner.transactions.insert(id, route);
	}

	pub fn untrack(&self, id: u64) {
		self.inner.transactions.remove(&id);
	}

	/// Returns true while transaction `id` awaits its reply.
	pub fn is_pending(&self, id: u64) -> bool {
		self.inner.transactions.contains_key(&id)
	}

	/// Number of outstanding outbound transactions.
	pub fn pending_count(&self) -> usize {
		self.inner.transactions.len()
	}

	/// Parses and routes one inbound payload.
	pub fn dispatch(&self, envelope: &Envelope) {
		if self.is_closed() {
			return;
		}

		let Some(message) = Message::parse(&envelope.data) else {
			tracing::debug!(origin = %envelope.origin, "ignoring malformed message");
			return;
		};

		if let Some(full) = message.method() {
			let (scope, method) = split_scope(full);
			let method = method.to_string();
			match self.find_bound(&envelope.origin, scope, envelope.source) {
				Some(route) => route.deliver(envelope, Some(&method), message),
				None => tracing::debug!(
					origin = %envelope.origin,
					scope,
					method = %method,
					"no channel bound for message"
				),
			}
		} else if let Some(id) = message.id() {
			let route = self
				.inner
				.transactions
				.get(&id)
				.map(|entry| Arc::clone(entry.value()));
			match route {
				Some(route) => route.deliver(envelope, None, message),
				None => tracing::debug!(id, "ignoring reply for unknown transaction"),
			}
		}
	}

	fn find_bound(&self, origin: &str, scope: &str, source: EndpointId) -> Option<Arc<dyn Route>> {
		let bound = self.inner.bound.lock();
		let lookup = |origin: &str| {
			bound
				.get(origin)
				.and_then(|scopes| scopes.get(scope))
				.and_then(|entries| entries.iter().find(|e| e.endpoint == source))
				.map(|e| Arc::clone(&e.route))
		};
		lookup(origin).or_else(|| lookup(ANY_ORIGIN))
	}

	/// Detaches from the window, clears both tables and tears down every
	/// bound route. Idempotent.
	pub fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		if let Some(attachment) = self.inner.attachment.lock().take() {
			attachment.window.remove_listener(attachment.listener);
		}

		let registry = std::mem::take(&mut *self.inner.bound.lock());
		self.inner.transactions.clear();

		let routes: Vec<Arc<dyn Route>> = registry
			.into_values()
			.flat_map(|scopes| scopes.into_values())
			.flatten()
			.map(|entry| entry.route)
			.collect();

		tracing::debug!(routes = routes.len(), "dispatcher shut down");
		for route in routes {
			route.shutdown();
		}
	}
}

impl Listener for Dispatcher {
	fn on_message(&self, envelope: &Envelope) {
		self.dispatch(envelope);
	}
}
