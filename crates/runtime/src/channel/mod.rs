//! Channel sessions.
//!
//! A [`Channel`] is bound to one remote endpoint, an expected origin (or
//! `"*"`) and an optional scope. It offers request/response calls with
//! optional callbacks and deadlines, fire-and-forget notifications and
//! handler registration.
//!
//! # Ready handshake
//!
//! Nothing but the handshake crosses the wire until both sides are listening.
//! The first call or notification sends a `__ready` notification carrying
//! `"ping"`; the peer flips to ready, answers `"pong"` and flushes its own
//! queue, and the pong flips this side. Messages queued before that flush in
//! the order they were sent.
//!
//! # Lifecycle
//!
//! `NotReady -> Ready -> Destroyed`, where `Destroyed` is reachable from any
//! state and final. The dispatcher keeps a bound channel alive until
//! [`Channel::destroy`] or [`Dispatcher::shutdown`].

mod call;
mod transaction;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use postchan_protocol::{
	ANY_ORIGIN, Callback, Message, Notification, READY_METHOD, READY_PING, READY_PONG, Request,
	SCOPE_SEPARATOR, normalize_origin, scoped_method, split_scope,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use call::{Call, CallbackFn, PendingCall};
pub use transaction::Transaction;

use crate::dispatcher::{Dispatcher, Route};
use crate::error::{Error, RemoteError, Result};
use crate::transport::{Endpoint, EndpointId, Envelope};

/// Handler bound to a method.
///
/// Requests receive `Some(transaction)`, notifications `None`. For requests
/// an `Ok` value completes the transaction unless the handler already
/// answered or delayed the return; an `Err` becomes the wire error reply.
pub type Handler =
	Arc<dyn Fn(Option<&Transaction>, Value) -> std::result::Result<Value, RemoteError> + Send + Sync>;

/// Hook invoked once the handshake completes.
pub type ReadyHook = Arc<dyn Fn(&Channel) + Send + Sync>;

/// Observer of messages crossing the channel, called with the peer origin.
pub type MessageObserver = Arc<dyn Fn(&str, &Message) + Send + Sync>;

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// Construction parameters of a [`Channel`].
pub struct ChannelConfig {
	endpoint: Arc<dyn Endpoint>,
	origin: String,
	scope: String,
	on_ready: Option<ReadyHook>,
	post_observer: Option<MessageObserver>,
	receive_observer: Option<MessageObserver>,
}

impl ChannelConfig {
	/// Targets `endpoint`, accepting messages only from `origin`.
	///
	/// `origin` must be `"*"` or an http(s) URL; paths are trimmed.
	pub fn new(endpoint: Arc<dyn Endpoint>, origin: impl Into<String>) -> Self {
		Self {
			endpoint,
			origin: origin.into(),
			scope: String::new(),
			on_ready: None,
			post_observer: None,
			receive_observer: None,
		}
	}

	/// Namespaces every method as `scope::method`.
	pub fn scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = scope.into();
		self
	}

	/// Runs `hook` when the channel becomes ready.
	pub fn on_ready<F>(mut self, hook: F) -> Self
	where
		F: Fn(&Channel) + Send + Sync + 'static,
	{
		self.on_ready = Some(Arc::new(hook));
		self
	}

	/// Sees every message right before it is posted.
	pub fn observe_posts<F>(mut self, observer: F) -> Self
	where
		F: Fn(&str, &Message) + Send + Sync + 'static,
	{
		self.post_observer = Some(Arc::new(observer));
		self
	}

	/// Sees every inbound message once it passed routing and origin checks.
	pub fn observe_received<F>(mut self, observer: F) -> Self
	where
		F: Fn(&str, &Message) + Send + Sync + 'static,
	{
		self.receive_observer = Some(Arc::new(observer));
		self
	}
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
	NotReady,
	Ready,
	Destroyed,
}

struct Outbound {
	method: String,
	reply: oneshot::Sender<Result<Value>>,
	callbacks: HashMap<String, CallbackFn>,
	timer: Option<JoinHandle<()>>,
}

struct State {
	phase: ChannelState,
	label: String,
	ping_sent: bool,
	pending: VecDeque<Message>,
	handlers: HashMap<String, Handler>,
	outbound: HashMap<u64, Outbound>,
	inbound: HashSet<u64>,
}

pub(crate) struct ChannelInner {
	me: Weak<ChannelInner>,
	endpoint: Arc<dyn Endpoint>,
	endpoint_id: EndpointId,
	origin: String,
	scope: String,
	dispatcher: Dispatcher,
	state: Mutex<State>,
	on_ready: Option<ReadyHook>,
	post_observer: Option<MessageObserver>,
	receive_observer: Option<MessageObserver>,
}

/// RPC session with one remote endpoint.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Channel {
	inner: Arc<ChannelInner>,
}

impl Channel {
	/// Validates `config` and binds a new channel into `dispatcher`.
	pub fn build(dispatcher: &Dispatcher, config: ChannelConfig) -> Result<Channel> {
		let origin = normalize_origin(&config.origin).ok_or_else(|| {
			Error::InvalidArgument(format!("invalid origin '{}'", config.origin))
		})?;

		if config.scope.contains(SCOPE_SEPARATOR) {
			return Err(Error::InvalidArgument(format!(
				"scope may not contain double colons: '{SCOPE_SEPARATOR}'"
			)));
		}

		let endpoint_id = config.endpoint.id();
		if dispatcher.local_endpoint() == Some(endpoint_id) {
			return Err(Error::InvalidArgument(
				"target endpoint is the local context".into(),
			));
		}

		let label = format!("chan-{}", NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed));
		let inner = Arc::new_cyclic(|me| ChannelInner {
			me: me.clone(),
			endpoint: config.endpoint,
			endpoint_id,
			origin,
			scope: config.scope,
			dispatcher: dispatcher.clone(),
			state: Mutex::new(State {
				phase: ChannelState::NotReady,
				label,
				ping_sent: false,
				pending: VecDeque::new(),
				handlers: HashMap::new(),
				outbound: HashMap::new(),
				inbound: HashSet::new(),
			}),
			on_ready: config.on_ready,
			post_observer: config.post_observer,
			receive_observer: config.receive_observer,
		});

		dispatcher.register(endpoint_id, &inner.origin, &inner.scope, inner.clone())?;

		tracing::debug!(
			chan = %inner.state.lock().label,
			origin = %inner.origin,
			scope = %inner.scope,
			endpoint = %endpoint_id,
			"channel built"
		);
		Ok(Channel { inner })
	}

	/// Registers `handler` for `method`.
	pub fn bind<F>(&self, method: impl Into<String>, handler: F) -> Result<()>
	where
		F: Fn(Option<&Transaction>, Value) -> std::result::Result<Value, RemoteError>
			+ Send
			+ Sync
			+ 'static,
	{
		let method = method.into();
		validate_method(&method)?;

		let mut state = self.inner.state.lock();
		if state.phase == ChannelState::Destroyed {
			return Err(Error::ChannelDestroyed);
		}
		if state.handlers.contains_key(&method) {
			return Err(Error::DuplicateHandler(method));
		}
		state.handlers.insert(method, Arc::new(handler));
		Ok(())
	}

	/// Removes the handler for `method`, returning whether one existed.
	pub fn unbind(&self, method: &str) -> bool {
		let mut state = self.inner.state.lock();
		let removed = state.handlers.remove(method);
		drop(state);
		removed.is_some()
	}

	/// Sends a request and returns a future for its reply.
	///
	/// Timeouts need a tokio runtime to drive their timer.
	pub fn call(&self, call: Call) -> Result<PendingCall> {
		validate_method(&call.method)?;
		call.validate_callbacks()?;
		let timer_runtime = match call.timeout {
			Some(_) => Some(tokio::runtime::Handle::try_current().map_err(|_| {
				Error::InvalidArgument("call timeouts require a tokio runtime".into())
			})?),
			None => None,
		};

		let inner = &self.inner;
		if inner.state.lock().phase == ChannelState::Destroyed {
			return Err(Error::ChannelDestroyed);
		}

		let Call {
			method,
			params,
			callbacks,
			timeout,
		} = call;

		let id = inner.dispatcher.allocate_id();
		let method = scoped_method(&inner.scope, &method);
		let names: Vec<String> = callbacks.iter().map(|(path, _)| path.clone()).collect();
		let request = Message::Request(Request {
			id,
			method: method.clone(),
			params: (!params.is_null()).then_some(params),
			callbacks: (!names.is_empty()).then_some(names),
		});

		let (tx, rx) = oneshot::channel();
		{
			let mut state = inner.state.lock();
			if state.phase == ChannelState::Destroyed {
				return Err(Error::ChannelDestroyed);
			}
			state.outbound.insert(
				id,
				Outbound {
					method: method.clone(),
					reply: tx,
					callbacks: callbacks.into_iter().collect(),
					timer: None,
				},
			);
		}
		inner.dispatcher.track(id, inner.clone());

		if let (Some(timeout), Some(runtime)) = (timeout, timer_runtime) {
			let channel = Arc::downgrade(inner);
			let timer = runtime.spawn(async move {
				tokio::time::sleep(timeout).await;
				if let Some(channel) = channel.upgrade() {
					channel.expire(id, timeout.as_millis() as u64);
				}
			});
			let mut state = inner.state.lock();
			match state.outbound.get_mut(&id) {
				Some(outbound) => outbound.timer = Some(timer),
				None => timer.abort(),
			}
		}

		if let Err(err) = inner.send(request, true) {
			inner.abandon(id);
			return Err(err);
		}

		tracing::debug!(id, method = %method, "call sent");
		Ok(PendingCall::new(id, rx, Arc::downgrade(inner)))
	}

	/// Sends a notification. It is never answered or tracked.
	pub fn notify(&self, method: &str, params: Value) -> Result<()> {
		validate_method(method)?;
		let notification = Message::Notification(Notification {
			method: scoped_method(&self.inner.scope, method),
			params: (!params.is_null()).then_some(params),
		});
		self.inner.send(notification, true)
	}

	/// Unbinds from the dispatcher and drops all local state.
	///
	/// Outstanding calls resolve with [`Error::ChannelDestroyed`]. Idempotent.
	pub fn destroy(&self) {
		self.inner.teardown(true);
	}

	pub fn state(&self) -> ChannelState {
		self.inner.state.lock().phase
	}

	pub fn is_ready(&self) -> bool {
		self.state() == ChannelState::Ready
	}

	/// Normalized origin the channel accepts messages from.
	pub fn origin(&self) -> &str {
		&self.inner.origin
	}

	pub fn scope(&self) -> &str {
		&self.inner.scope
	}

	/// Short label used in log output.
	pub fn label(&self) -> String {
		self.inner.state.lock().label.clone()
	}
}

impl fmt::Debug for Channel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.inner.state.lock();
		f.debug_struct("Channel")
			.field("label", &state.label)
			.field("origin", &self.inner.origin)
			.field("scope", &self.inner.scope)
			.field("state", &state.phase)
			.finish()
	}
}

fn validate_method(method: &str) -> Result<()> {
	if method.is_empty() {
		return Err(Error::InvalidArgument("method must not be empty".into()));
	}
	if method.contains(SCOPE_SEPARATOR) {
		return Err(Error::InvalidArgument(format!(
			"method '{method}' may not contain '{SCOPE_SEPARATOR}'"
		)));
	}
	if method == READY_METHOD {
		return Err(Error::InvalidArgument(format!(
			"method '{READY_METHOD}' is reserved"
		)));
	}
	Ok(())
}

impl ChannelInner {
	fn control(&self, params: &str) -> Message {
		Message::Notification(Notification {
			method: scoped_method(&self.scope, READY_METHOD),
			params: Some(Value::String(params.to_string())),
		})
	}

	/// Posts one message. Callers hold the state lock so the queue order is
	/// the wire order.
	fn transmit(&self, label: &str, message: &Message) {
		match message.to_json() {
			Ok(data) => {
				tracing::debug!(chan = %label, "post {}", data);
				self.endpoint.post(data, &self.origin);
			}
			Err(err) => tracing::error!(chan = %label, "failed to serialize message: {}", err),
		}
	}

	fn observe_posts(&self, messages: &[Message]) {
		if let Some(observer) = &self.post_observer {
			for message in messages {
				observer(&self.origin, message);
			}
		}
	}

	/// Posts `message`, or queues it while the handshake is pending.
	///
	/// With `handshake`, the first queued message also sends the ping.
	fn send(&self, message: Message, handshake: bool) -> Result<()> {
		let mut posted = Vec::with_capacity(2);
		{
			let mut state = self.state.lock();
			match state.phase {
				ChannelState::Destroyed => return Err(Error::ChannelDestroyed),
				ChannelState::NotReady => {
					if handshake && !state.ping_sent {
						state.ping_sent = true;
						let ping = self.control(READY_PING);
						self.transmit(&state.label, &ping);
						posted.push(ping);
					}
					tracing::debug!(chan = %state.label, "queue message");
					state.pending.push_back(message);
				}
				ChannelState::Ready => {
					self.transmit(&state.label, &message);
					posted.push(message);
				}
			}
		}
		self.observe_posts(&posted);
		Ok(())
	}

	fn on_ready_message(&self, params: Option<&Value>) -> Result<()> {
		let is_ping = match params.and_then(Value::as_str) {
			Some(READY_PING) => true,
			Some(READY_PONG) => false,
			_ => {
				return Err(Error::ProtocolViolation(
					"malformed ready message".into(),
				));
			}
		};

		let mut posted = Vec::new();
		{
			let mut state = self.state.lock();
			match state.phase {
				ChannelState::Ready => {
					return Err(Error::ProtocolViolation(
						"received ready message while in ready state".into(),
					));
				}
				ChannelState::Destroyed => return Ok(()),
				ChannelState::NotReady => {}
			}

			state.phase = ChannelState::Ready;
			state.label.push_str(if is_ping { "-R" } else { "-L" });
			tracing::debug!(chan = %state.label, "ready msg accepted");

			if is_ping {
				let pong = self.control(READY_PONG);
				self.transmit(&state.label, &pong);
				posted.push(pong);
			}
			while let Some(message) = state.pending.pop_front() {
				self.transmit(&state.label, &message);
				posted.push(message);
			}
		}

		self.observe_posts(&posted);
		if let (Some(hook), Some(inner)) = (&self.on_ready, self.me.upgrade()) {
			hook(&Channel { inner });
		}
		Ok(())
	}

	fn handle_request(&self, envelope: &Envelope, method: &str, request: Request) {
		let handler = {
			let mut state = self.state.lock();
			if state.phase == ChannelState::Destroyed {
				return;
			}
			let handler = state.handlers.get(method).cloned();
			if handler.is_some() {
				state.inbound.insert(request.id);
			}
			handler
		};

		let Some(handler) = handler else {
			tracing::debug!(id = request.id, method, "no handler bound for request");
			return;
		};

		let transaction = Transaction::new(
			request.id,
			envelope.origin.clone(),
			request.callbacks.unwrap_or_default(),
			self.me.clone(),
		);

		match handler(Some(&transaction), request.params.unwrap_or(Value::Null)) {
			Ok(result) => {
				if transaction.is_delayed() || transaction.is_completed() {
					return;
				}
				if let Err(err) = transaction.complete(result) {
					tracing::warn!(id = request.id, method, "failed to complete request: {}", err);
				}
			}
			Err(err) => {
				if transaction.is_completed() {
					tracing::warn!(
						id = request.id,
						method,
						"handler failed after answering: {}",
						err
					);
					return;
				}
				if let Err(send_err) = transaction.error(err.code, err.message) {
					tracing::warn!(id = request.id, method, "failed to send error reply: {}", send_err);
				}
			}
		}
	}

	fn handle_notification(&self, method: &str, params: Option<Value>) {
		if method == READY_METHOD {
			if let Err(err) = self.on_ready_message(params.as_ref()) {
				tracing::warn!(origin = %self.origin, "ignoring handshake message: {}", err);
			}
			return;
		}

		let handler = self.state.lock().handlers.get(method).cloned();
		match handler {
			Some(handler) => {
				if let Err(err) = handler(None, params.unwrap_or(Value::Null)) {
					tracing::warn!(method, "notification handler failed: {}", err);
				}
			}
			None => tracing::debug!(method, "no handler bound for notification"),
		}
	}

	fn handle_callback(&self, callback: Callback) {
		let target = self
			.state
			.lock()
			.outbound
			.get(&callback.id)
			.and_then(|outbound| outbound.callbacks.get(&callback.callback).cloned());

		match target {
			Some(target) => target(callback.params.unwrap_or(Value::Null)),
			None => tracing::debug!(
				id = callback.id,
				callback = %callback.callback,
				"ignoring invalid callback"
			),
		}
	}

	fn take_outbound(&self, id: u64) -> Option<Outbound> {
		let outbound = self.state.lock().outbound.remove(&id)?;
		self.dispatcher.untrack(id);
		Some(outbound)
	}

	/// Resolves an outbound call with its terminal reply.
	fn resolve(&self, id: u64, result: Result<Value>) {
		let Some(outbound) = self.take_outbound(id) else {
			tracing::debug!(id, "ignoring invalid response");
			return;
		};
		if let Some(timer) = outbound.timer {
			timer.abort();
		}
		let _ = outbound.reply.send(result);
	}

	fn expire(&self, id: u64, timeout_ms: u64) {
		if let Some(outbound) = self.take_outbound(id) {
			tracing::debug!(id, method = %outbound.method, timeout_ms, "call timed out");
			let _ = outbound.reply.send(Err(Error::Timeout {
				method: outbound.method,
				timeout_ms,
			}));
		}
	}

	/// Forgets an outbound call whose caller stopped waiting.
	pub(crate) fn abandon(&self, id: u64) {
		if let Some(outbound) = self.take_outbound(id) {
			if let Some(timer) = outbound.timer {
				timer.abort();
			}
			tracing::debug!(id, "abandoned call");
		}
	}

	pub(crate) fn send_callback(&self, id: u64, message: Message) -> Result<()> {
		{
			let state = self.state.lock();
			if state.phase == ChannelState::Destroyed {
				return Err(Error::ChannelDestroyed);
			}
			if !state.inbound.contains(&id) {
				return Err(Error::ProtocolViolation(format!(
					"attempting to invoke a callback of a nonexistent transaction: {id}"
				)));
			}
		}
		self.send(message, false)
	}

	pub(crate) fn finish_inbound(&self, id: u64, message: Message) -> Result<()> {
		{
			let mut state = self.state.lock();
			if state.phase == ChannelState::Destroyed {
				return Err(Error::ChannelDestroyed);
			}
			if !state.inbound.remove(&id) {
				return Err(Error::ProtocolViolation(format!(
					"transaction {id} is not open"
				)));
			}
		}
		self.send(message, false)
	}

	fn accepts(&self, envelope: &Envelope) -> bool {
		envelope.source == self.endpoint_id
			&& (self.origin == ANY_ORIGIN || envelope.origin == self.origin)
	}

	fn teardown(&self, unregister: bool) {
		let (label, pending, handlers, outbound) = {
			let mut state = self.state.lock();
			if state.phase == ChannelState::Destroyed {
				return;
			}
			state.phase = ChannelState::Destroyed;
			state.inbound.clear();
			(
				state.label.clone(),
				std::mem::take(&mut state.pending),
				std::mem::take(&mut state.handlers),
				std::mem::take(&mut state.outbound),
			)
		};

		if unregister {
			self.dispatcher
				.unregister(self.endpoint_id, &self.origin, &self.scope);
		}
		for (id, call) in &outbound {
			self.dispatcher.untrack(*id);
			if let Some(timer) = &call.timer {
				timer.abort();
			}
		}
		drop((pending, handlers, outbound));
		tracing::debug!(chan = %label, "channel destroyed");
	}
}

impl Route for ChannelInner {
	fn deliver(&self, envelope: &Envelope, method: Option<&str>, message: Message) {
		if !self.accepts(envelope) {
			tracing::debug!(
				origin = %envelope.origin,
				source = %envelope.source,
				"ignoring message from unexpected sender"
			);
			return;
		}
		if let Some(observer) = &self.receive_observer {
			observer(&envelope.origin, &message);
		}

		match message {
			Message::Request(request) => {
				let method = method
					.map(str::to_string)
					.unwrap_or_else(|| split_scope(&request.method).1.to_string());
				self.handle_request(envelope, &method, request);
			}
			Message::Notification(notification) => {
				let method = method
					.map(str::to_string)
					.unwrap_or_else(|| split_scope(&notification.method).1.to_string());
				self.handle_notification(&method, notification.params);
			}
			Message::Callback(callback) => self.handle_callback(callback),
			Message::Error(error) => self.resolve(
				error.id,
				Err(Error::Remote {
					code: error.error,
					message: error.message.unwrap_or_default(),
				}),
			),
			Message::Response(response) => {
				self.resolve(response.id, Ok(response.result.unwrap_or(Value::Null)))
			}
		}
	}

	fn shutdown(&self) {
		self.teardown(false);
	}
}
