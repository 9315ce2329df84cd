//! Popup handshake.
//!
//! [`open`] runs on the opener: it opens a popup at a trusted URL, waits for
//! the popup to announce `ready`, sends one request and reports the single
//! response (or error) to a callback. [`on_open`] runs inside the popup and
//! hands that request to application code.
//!
//! On platforms where popup to opener delivery is unreliable
//! ([`Capabilities::relay`](crate::window::Capabilities::relay)), the opener
//! hosts a hidden relay frame served from the popup's origin. The popup finds
//! it among the opener's frames, posts through it, and listens on it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use postchan_protocol::{
	CLIENT_CLOSED_WINDOW, PopupOptions, RELAY_FRAME_NAME, WinChanMessage, error_text, extract_origin,
};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::{Endpoint, Envelope, Listener, ListenerId};
use crate::window::{RelayFrame, Window};

type OpenCallback = Box<dyn FnOnce(Result<Value>) + Send>;

/// Progress of an opener-side exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
	/// Popup opened, waiting for `ready`.
	Opening,
	/// `ready` arrived through the relay frame.
	RelayReady,
	/// Request sent.
	WaitingResponse,
	Completed,
	Errored,
	/// The popup reported it was closed before answering.
	ClosedByUser,
	/// The opener unloaded before the exchange finished.
	Abandoned,
}

impl ExchangePhase {
	pub fn is_terminal(self) -> bool {
		matches!(
			self,
			ExchangePhase::Completed
				| ExchangePhase::Errored
				| ExchangePhase::ClosedByUser
				| ExchangePhase::Abandoned
		)
	}
}

struct ExchangeState {
	phase: ExchangePhase,
	popup: Option<Arc<dyn Endpoint>>,
	relay: Option<Arc<dyn RelayFrame>>,
	listener: Option<ListenerId>,
	callback: Option<OpenCallback>,
}

struct Exchange {
	window: Arc<dyn Window>,
	origin: String,
	request: String,
	state: Mutex<ExchangeState>,
}

/// Handle to an opened popup.
#[derive(Clone)]
pub struct PopupHandle {
	exchange: Arc<Exchange>,
}

impl PopupHandle {
	/// Closes the popup. The popup reports the closure as
	/// [`CLIENT_CLOSED_WINDOW`] if it had not answered yet.
	pub fn close(&self) {
		let popup = self.exchange.state.lock().popup.take();
		if let Some(popup) = popup {
			popup.close();
		}
	}

	pub fn focus(&self) {
		let popup = self.exchange.state.lock().popup.clone();
		if let Some(popup) = popup {
			popup.focus();
		}
	}

	pub fn phase(&self) -> ExchangePhase {
		self.exchange.state.lock().phase
	}

	/// Origin the popup is expected to answer from.
	pub fn origin(&self) -> &str {
		&self.exchange.origin
	}
}

impl fmt::Debug for PopupHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PopupHandle")
			.field("origin", &self.exchange.origin)
			.field("phase", &self.phase())
			.finish()
	}
}

fn fail_later<F>(window: &dyn Window, callback: F, err: Error)
where
	F: FnOnce(Result<Value>) + Send + 'static,
{
	tracing::debug!("popup exchange failed: {}", err);
	window.defer(Box::new(move || callback(Err(err))));
}

/// Opens a popup at `options.url` and exchanges one request with it.
///
/// `callback` receives the popup's response, or the error that ended the
/// exchange. Setup failures are reported to it asynchronously and yield
/// `None`. The callback is not invoked if `window` unloads first.
pub fn open<F>(window: Arc<dyn Window>, options: PopupOptions, callback: F) -> Option<PopupHandle>
where
	F: FnOnce(Result<Value>) + Send + 'static,
{
	let capabilities = window.capabilities();
	if !capabilities.supported {
		fail_later(window.as_ref(), callback, Error::Unsupported);
		return None;
	}

	let origin = extract_origin(&options.url);
	let relay_origin = extract_origin(&options.relay_url);
	if origin != relay_origin {
		fail_later(
			window.as_ref(),
			callback,
			Error::OriginMismatch {
				url_origin: origin,
				relay_origin,
			},
		);
		return None;
	}

	let request = match WinChanMessage::Request(options.arg).to_json() {
		Ok(request) => request,
		Err(err) => {
			fail_later(window.as_ref(), callback, err.into());
			return None;
		}
	};

	let exchange = Arc::new(Exchange {
		window: Arc::clone(&window),
		origin,
		request,
		state: Mutex::new(ExchangeState {
			phase: ExchangePhase::Opening,
			popup: None,
			relay: None,
			listener: None,
			callback: None,
		}),
	});

	let mut state = exchange.state.lock();
	if capabilities.relay {
		let Some(frame) = window.create_relay_frame(&options.relay_url, RELAY_FRAME_NAME) else {
			drop(state);
			fail_later(window.as_ref(), callback, Error::RelayNotFound);
			return None;
		};
		state.relay = Some(frame);
	}
	state.listener = Some(window.add_listener(exchange.clone()));

	let features = if capabilities.ignore_popup_features {
		None
	} else {
		options.features.as_deref()
	};

	match window.open_popup(&options.url, features) {
		Some(popup) => state.popup = Some(popup),
		None => {
			state.phase = ExchangePhase::Errored;
			let listener = state.listener.take();
			let relay = state.relay.take();
			drop(state);
			if let Some(listener) = listener {
				window.remove_listener(listener);
			}
			if let Some(relay) = relay {
				relay.remove();
			}
			fail_later(window.as_ref(), callback, Error::PopupBlocked);
			return None;
		}
	}

	state.callback = Some(Box::new(callback));
	drop(state);

	tracing::debug!(url = %options.url, origin = %exchange.origin, relay = capabilities.relay, "popup opened");
	Some(PopupHandle { exchange })
}

impl Exchange {
	fn post_request(&self, state: &mut ExchangeState) {
		let target = match (&state.relay, &state.popup) {
			(Some(relay), _) => relay.endpoint(),
			(None, Some(popup)) => Arc::clone(popup),
			(None, None) => return,
		};
		target.post(self.request.clone(), &self.origin);
		state.phase = ExchangePhase::WaitingResponse;
	}

	/// Ends the exchange: releases the popup and relay frame and reports
	/// `result` unless it is `None`.
	fn finish(&self, phase: ExchangePhase, result: Option<Result<Value>>) {
		let (listener, popup, relay, callback) = {
			let mut state = self.state.lock();
			if state.phase.is_terminal() {
				return;
			}
			state.phase = phase;
			(
				state.listener.take(),
				state.popup.take(),
				state.relay.take(),
				state.callback.take(),
			)
		};

		tracing::debug!(origin = %self.origin, ?phase, "popup exchange finished");
		if let Some(listener) = listener {
			self.window.remove_listener(listener);
		}
		if let Some(popup) = popup {
			popup.close();
		}
		if let Some(relay) = relay {
			relay.remove();
		}
		if let (Some(callback), Some(result)) = (callback, result) {
			callback(result);
		}
	}
}

impl Listener for Exchange {
	fn on_message(&self, envelope: &Envelope) {
		if envelope.origin != self.origin {
			return;
		}
		let Some(message) = WinChanMessage::parse(&envelope.data) else {
			return;
		};

		match message {
			WinChanMessage::Ready => {
				let mut state = self.state.lock();
				if state.phase != ExchangePhase::Opening {
					tracing::debug!(phase = ?state.phase, "ignoring repeated ready");
					return;
				}
				if state.relay.is_some() {
					state.phase = ExchangePhase::RelayReady;
				}
				self.post_request(&mut state);
			}
			WinChanMessage::Response(d) => self.finish(ExchangePhase::Completed, Some(Ok(d))),
			WinChanMessage::Error(d) => {
				let text = error_text(&d);
				let phase = if text == CLIENT_CLOSED_WINDOW {
					ExchangePhase::ClosedByUser
				} else {
					ExchangePhase::Errored
				};
				self.finish(phase, Some(Err(Error::Exchange(text))));
			}
			WinChanMessage::Request(_) => {}
		}
	}

	fn on_unload(&self) {
		self.finish(ExchangePhase::Abandoned, None);
	}
}

type OpenHandler = Box<dyn FnOnce(String, Value, Responder) + Send>;

enum ReplyPath {
	Direct(Arc<dyn Endpoint>),
	Relay(Arc<dyn RelayFrame>),
}

impl ReplyPath {
	fn post(&self, message: &WinChanMessage, target_origin: &str) {
		let data = match message.to_json() {
			Ok(data) => data,
			Err(err) => {
				tracing::error!("failed to serialize popup message: {}", err);
				return;
			}
		};
		match self {
			ReplyPath::Direct(opener) => opener.post(data, target_origin),
			ReplyPath::Relay(frame) => frame.do_post(data, target_origin),
		}
	}
}

struct PopupState {
	origin: String,
	handler: Option<OpenHandler>,
	finished: bool,
	frame_listener: Option<ListenerId>,
}

struct PopupSession {
	window: Arc<dyn Window>,
	path: ReplyPath,
	state: Mutex<PopupState>,
}

/// Single-use reply handle passed to the [`on_open`] handler.
pub struct Responder {
	session: Arc<PopupSession>,
}

impl Responder {
	/// Origin the request came from, where the response is posted.
	pub fn origin(&self) -> String {
		self.session.state.lock().origin.clone()
	}

	/// Posts the response to the requesting origin.
	pub fn respond(self, result: Value) -> Result<()> {
		let origin = {
			let mut state = self.session.state.lock();
			if state.finished {
				return Err(Error::ProtocolViolation(
					"popup exchange already finished".into(),
				));
			}
			state.finished = true;
			state.origin.clone()
		};
		self.session
			.path
			.post(&WinChanMessage::Response(result), &origin);
		tracing::debug!(origin = %origin, "popup responded");
		Ok(())
	}
}

impl fmt::Debug for Responder {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Responder")
			.field("origin", &self.origin())
			.finish()
	}
}

/// Routes popup events into the session. On the relay path requests arrive
/// on the frame while unload arrives on the window.
struct PopupListener {
	session: Arc<PopupSession>,
	messages: bool,
	unload: bool,
}

impl Listener for PopupListener {
	fn on_message(&self, envelope: &Envelope) {
		if self.messages {
			self.session.on_request(envelope);
		}
	}

	fn on_unload(&self) {
		if self.unload {
			self.session.on_unload();
		}
	}
}

impl PopupSession {
	fn on_request(self: &Arc<Self>, envelope: &Envelope) {
		let Some(WinChanMessage::Request(arg)) = WinChanMessage::parse(&envelope.data) else {
			return;
		};
		let handler = {
			let mut state = self.state.lock();
			if state.finished {
				return;
			}
			let Some(handler) = state.handler.take() else {
				tracing::debug!(origin = %envelope.origin, "ignoring repeated request");
				return;
			};
			state.origin = envelope.origin.clone();
			handler
		};

		tracing::debug!(origin = %envelope.origin, "popup request received");
		handler(
			envelope.origin.clone(),
			arg,
			Responder {
				session: Arc::clone(self),
			},
		);
	}

	fn on_unload(&self) {
		let (unanswered, origin, frame_listener) = {
			let mut state = self.state.lock();
			let unanswered = !state.finished;
			state.finished = true;
			(unanswered, state.origin.clone(), state.frame_listener.take())
		};

		if unanswered {
			self.path
				.post(&WinChanMessage::error(CLIENT_CLOSED_WINDOW), &origin);
		}
		if let (Some(id), ReplyPath::Relay(frame)) = (frame_listener, &self.path) {
			frame.remove_listener(id);
		}
		self.window.close();
	}
}

/// Serves the request of the window that opened `window`.
///
/// Announces readiness to the opener, then calls `handler` with the
/// requesting origin, the request argument and a [`Responder`] for the first
/// request only. If the window unloads before responding, the opener receives
/// [`CLIENT_CLOSED_WINDOW`].
///
/// Unlike [`open`], setup failures are returned directly: `handler` only ever
/// sees a request, so [`Error::Unsupported`], [`Error::NoOpener`] and
/// [`Error::RelayNotFound`] have nowhere else to go.
pub fn on_open<F>(window: Arc<dyn Window>, handler: F) -> Result<()>
where
	F: FnOnce(String, Value, Responder) + Send + 'static,
{
	let capabilities = window.capabilities();
	if !capabilities.supported {
		return Err(Error::Unsupported);
	}
	let opener = window.opener().ok_or(Error::NoOpener)?;

	let path = if capabilities.relay {
		let own_origin = window.origin();
		let frame = window
			.opener_frames()
			.into_iter()
			.find(|frame| {
				frame.name() == RELAY_FRAME_NAME && frame.origin().as_deref() == Some(own_origin.as_str())
			})
			.ok_or(Error::RelayNotFound)?;
		ReplyPath::Relay(frame)
	} else {
		ReplyPath::Direct(opener)
	};

	let session = Arc::new(PopupSession {
		window: Arc::clone(&window),
		path,
		state: Mutex::new(PopupState {
			origin: postchan_protocol::ANY_ORIGIN.to_string(),
			handler: Some(Box::new(handler)),
			finished: false,
			frame_listener: None,
		}),
	});

	match &session.path {
		ReplyPath::Direct(_) => {
			window.add_listener(Arc::new(PopupListener {
				session: Arc::clone(&session),
				messages: true,
				unload: true,
			}));
		}
		ReplyPath::Relay(frame) => {
			let id = frame.add_listener(Arc::new(PopupListener {
				session: Arc::clone(&session),
				messages: true,
				unload: false,
			}));
			session.state.lock().frame_listener = Some(id);
			window.add_listener(Arc::new(PopupListener {
				session: Arc::clone(&session),
				messages: false,
				unload: true,
			}));
		}
	}

	session
		.path
		.post(&WinChanMessage::Ready, postchan_protocol::ANY_ORIGIN);
	tracing::debug!(window = %window.id(), relay = capabilities.relay, "popup ready");
	Ok(())
}
