//! In-process transport.
//!
//! A [`MemoryBrowser`] hosts [`MemoryWindow`]s that post to each other through
//! per-window inboxes. Every window pumps its inbox from a spawned tokio task,
//! so delivery is asynchronous and ordered per receiver. Posts are filtered by
//! target origin and silently dropped once the receiver is closed.
//!
//! Popups opened with [`Window::open_popup`] run the page script registered
//! for the longest matching URL prefix, which is how tests model the code a
//! popup loads.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use postchan_protocol::{ANY_ORIGIN, extract_origin};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Endpoint, EndpointId, Envelope, Listener, ListenerId, next_listener_id};
use crate::window::{Capabilities, RelayFrame, Window};

/// Code run in a freshly opened popup.
pub type PageScript = Arc<dyn Fn(MemoryWindow) + Send + Sync>;

struct BrowserInner {
	runtime: Handle,
	next_id: AtomicU64,
	capabilities: Mutex<Capabilities>,
	block_popups: AtomicBool,
	pages: Mutex<Vec<(String, PageScript)>>,
	popups: Mutex<Vec<MemoryWindow>>,
}

/// Host of in-memory windows.
#[derive(Clone)]
pub struct MemoryBrowser {
	inner: Arc<BrowserInner>,
}

impl MemoryBrowser {
	/// Creates a browser delivering on the current tokio runtime.
	pub fn new() -> Result<Self> {
		let runtime = Handle::try_current()
			.map_err(|_| Error::InvalidArgument("memory browser requires a tokio runtime".into()))?;
		Ok(Self {
			inner: Arc::new(BrowserInner {
				runtime,
				next_id: AtomicU64::new(1),
				capabilities: Mutex::new(Capabilities::default()),
				block_popups: AtomicBool::new(false),
				pages: Mutex::new(Vec::new()),
				popups: Mutex::new(Vec::new()),
			}),
		})
	}

	/// Capabilities reported by every window of this browser.
	pub fn set_capabilities(&self, capabilities: Capabilities) {
		*self.inner.capabilities.lock() = capabilities;
	}

	pub fn capabilities(&self) -> Capabilities {
		*self.inner.capabilities.lock()
	}

	/// Makes [`Window::open_popup`] refuse, as a popup blocker would.
	pub fn block_popups(&self, block: bool) {
		self.inner.block_popups.store(block, Ordering::SeqCst);
	}

	/// Runs `script` in every popup whose URL starts with `url_prefix`.
	pub fn page<F>(&self, url_prefix: impl Into<String>, script: F)
	where
		F: Fn(MemoryWindow) + Send + Sync + 'static,
	{
		self.inner.pages.lock().push((url_prefix.into(), Arc::new(script)));
	}

	/// Opens a top-level window at `url`.
	pub fn open_window(&self, url: &str) -> MemoryWindow {
		MemoryWindow::spawn(&self.inner, url, String::new(), None, None, None)
	}

	/// Popups in opening order. Closed popups stay listed until the next
	/// popup opens.
	pub fn popups(&self) -> Vec<MemoryWindow> {
		self.inner.popups.lock().clone()
	}

	fn script_for(&self, url: &str) -> Option<PageScript> {
		self.inner
			.pages
			.lock()
			.iter()
			.filter(|(prefix, _)| url.starts_with(prefix.as_str()))
			.max_by_key(|(prefix, _)| prefix.len())
			.map(|(_, script)| Arc::clone(script))
	}
}

impl fmt::Debug for MemoryBrowser {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MemoryBrowser")
			.field("capabilities", &self.capabilities())
			.field("popups", &self.inner.popups.lock().len())
			.finish()
	}
}

struct WindowInner {
	id: EndpointId,
	url: String,
	origin: String,
	name: String,
	features: Option<String>,
	browser: Weak<BrowserInner>,
	inbox: mpsc::UnboundedSender<Envelope>,
	listeners: Mutex<Vec<(ListenerId, Arc<dyn Listener>)>>,
	opener: Option<Weak<WindowInner>>,
	parent: Option<Weak<WindowInner>>,
	frames: Mutex<Vec<MemoryWindow>>,
	closing: AtomicBool,
	closed: AtomicBool,
	focused: AtomicUsize,
}

/// A window, popup or frame of a [`MemoryBrowser`].
#[derive(Clone)]
pub struct MemoryWindow {
	inner: Arc<WindowInner>,
}

impl MemoryWindow {
	fn spawn(
		browser: &Arc<BrowserInner>,
		url: &str,
		name: String,
		features: Option<String>,
		opener: Option<Weak<WindowInner>>,
		parent: Option<Weak<WindowInner>>,
	) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
		let inner = Arc::new(WindowInner {
			id: EndpointId(browser.next_id.fetch_add(1, Ordering::SeqCst)),
			url: url.to_string(),
			origin: extract_origin(url),
			name,
			features,
			browser: Arc::downgrade(browser),
			inbox: tx,
			listeners: Mutex::new(Vec::new()),
			opener,
			parent,
			frames: Mutex::new(Vec::new()),
			closing: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			focused: AtomicUsize::new(0),
		});

		let weak = Arc::downgrade(&inner);
		browser.runtime.spawn(async move {
			while let Some(envelope) = rx.recv().await {
				let Some(window) = weak.upgrade() else { break };
				if window.closed.load(Ordering::SeqCst) {
					continue;
				}
				let listeners: Vec<Arc<dyn Listener>> = window
					.listeners
					.lock()
					.iter()
					.map(|(_, l)| Arc::clone(l))
					.collect();
				for listener in listeners {
					listener.on_message(&envelope);
				}
			}
		});

		tracing::debug!(window = %inner.id, url, "window opened");
		Self { inner }
	}

	pub fn url(&self) -> &str {
		&self.inner.url
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Feature string the popup was opened with.
	pub fn features(&self) -> Option<&str> {
		self.inner.features.as_deref()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Number of times the window was brought to the foreground.
	pub fn focus_count(&self) -> usize {
		self.inner.focused.load(Ordering::SeqCst)
	}

	/// Child frames currently attached.
	pub fn frames(&self) -> Vec<MemoryWindow> {
		self.inner.frames.lock().clone()
	}

	/// Number of registered listeners.
	pub fn listener_count(&self) -> usize {
		self.inner.listeners.lock().len()
	}

	/// Attaches a child frame loading `url`, `None` once the browser is gone.
	pub fn add_frame(&self, url: &str, name: &str) -> Option<MemoryWindow> {
		let browser = self.inner.browser.upgrade()?;
		let frame = MemoryWindow::spawn(
			&browser,
			url,
			name.to_string(),
			None,
			None,
			Some(Arc::downgrade(&self.inner)),
		);
		self.inner.frames.lock().push(frame.clone());
		Some(frame)
	}

	/// Handle this window uses to post to `target`.
	pub fn endpoint_for(&self, target: &MemoryWindow) -> Arc<dyn Endpoint> {
		Arc::new(MemoryEndpoint {
			source: Arc::downgrade(&self.inner),
			target: Arc::downgrade(&target.inner),
		})
	}

	/// Handle to the hosting window of a frame.
	pub fn parent(&self) -> Option<Arc<dyn Endpoint>> {
		let parent = self.inner.parent.as_ref()?.upgrade()?;
		Some(self.endpoint_for(&MemoryWindow { inner: parent }))
	}

	fn opener_window(&self) -> Option<MemoryWindow> {
		let opener = self.inner.opener.as_ref()?.upgrade()?;
		(!opener.closed.load(Ordering::SeqCst)).then_some(MemoryWindow { inner: opener })
	}

	fn relay(&self, frame: MemoryWindow) -> Arc<dyn RelayFrame> {
		Arc::new(MemoryRelay {
			frame,
			viewer: self.clone(),
		})
	}

	fn detach_frame(&self, frame: EndpointId) {
		self.inner.frames.lock().retain(|f| f.inner.id != frame);
	}
}

impl fmt::Debug for MemoryWindow {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MemoryWindow")
			.field("id", &self.inner.id)
			.field("url", &self.inner.url)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl Window for MemoryWindow {
	fn id(&self) -> EndpointId {
		self.inner.id
	}

	fn origin(&self) -> String {
		self.inner.origin.clone()
	}

	fn capabilities(&self) -> Capabilities {
		self.inner
			.browser
			.upgrade()
			.map(|b| *b.capabilities.lock())
			.unwrap_or_default()
	}

	fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
		let id = next_listener_id();
		if !self.is_closed() {
			self.inner.listeners.lock().push((id, listener));
		}
		id
	}

	fn remove_listener(&self, id: ListenerId) {
		self.inner.listeners.lock().retain(|(l, _)| *l != id);
	}

	fn open_popup(&self, url: &str, features: Option<&str>) -> Option<Arc<dyn Endpoint>> {
		let browser = self.inner.browser.upgrade()?;
		if browser.block_popups.load(Ordering::SeqCst) || self.is_closed() {
			tracing::debug!(url, "popup blocked");
			return None;
		}

		let popup = MemoryWindow::spawn(
			&browser,
			url,
			String::new(),
			features.map(str::to_string),
			Some(Arc::downgrade(&self.inner)),
			None,
		);
		{
			let mut popups = browser.popups.lock();
			popups.retain(|p| !p.is_closed());
			popups.push(popup.clone());
		}

		let host = MemoryBrowser {
			inner: Arc::clone(&browser),
		};
		if let Some(script) = host.script_for(url) {
			let page = popup.clone();
			browser.runtime.spawn(async move { script(page) });
		}

		Some(self.endpoint_for(&popup))
	}

	fn create_relay_frame(&self, url: &str, name: &str) -> Option<Arc<dyn RelayFrame>> {
		if self.is_closed() {
			return None;
		}
		let frame = self.add_frame(url, name)?;
		Some(self.relay(frame))
	}

	fn opener(&self) -> Option<Arc<dyn Endpoint>> {
		let opener = self.opener_window()?;
		Some(self.endpoint_for(&opener))
	}

	fn opener_frames(&self) -> Vec<Arc<dyn RelayFrame>> {
		match self.opener_window() {
			Some(opener) => opener
				.frames()
				.into_iter()
				.map(|frame| self.relay(frame))
				.collect(),
			None => Vec::new(),
		}
	}

	fn defer(&self, task: Box<dyn FnOnce() + Send>) {
		match self.inner.browser.upgrade() {
			Some(browser) => {
				browser.runtime.spawn(async move { task() });
			}
			None => tracing::debug!(window = %self.inner.id, "browser gone, deferred task dropped"),
		}
	}

	/// Fires unload on every listener, then closes the window and its frames.
	///
	/// Unload listeners may still post; nothing is delivered to the window
	/// afterwards.
	fn close(&self) {
		if self.inner.closing.swap(true, Ordering::SeqCst) {
			return;
		}

		let listeners: Vec<Arc<dyn Listener>> = self
			.inner
			.listeners
			.lock()
			.iter()
			.map(|(_, l)| Arc::clone(l))
			.collect();
		for listener in listeners {
			listener.on_unload();
		}

		self.inner.closed.store(true, Ordering::SeqCst);
		self.inner.listeners.lock().clear();
		let frames = std::mem::take(&mut *self.inner.frames.lock());
		for frame in frames {
			frame.close();
		}
		tracing::debug!(window = %self.inner.id, "window closed");
	}
}

struct MemoryEndpoint {
	source: Weak<WindowInner>,
	target: Weak<WindowInner>,
}

impl Endpoint for MemoryEndpoint {
	fn id(&self) -> EndpointId {
		self.target.upgrade().map(|t| t.id).unwrap_or(EndpointId(0))
	}

	fn post(&self, data: String, target_origin: &str) {
		let (Some(source), Some(target)) = (self.source.upgrade(), self.target.upgrade()) else {
			return;
		};
		if source.closed.load(Ordering::SeqCst) || target.closed.load(Ordering::SeqCst) {
			tracing::debug!(target = %target.id, "dropping post to closed window");
			return;
		}
		if target_origin != ANY_ORIGIN && target_origin != target.origin {
			tracing::debug!(
				target = %target.id,
				target_origin,
				actual = %target.origin,
				"dropping post with mismatched target origin"
			);
			return;
		}
		let _ = target.inbox.send(Envelope {
			data,
			source: source.id,
			origin: source.origin.clone(),
		});
	}

	fn close(&self) {
		if let Some(target) = self.target.upgrade() {
			MemoryWindow { inner: target }.close();
		}
	}

	fn focus(&self) {
		if let Some(target) = self.target.upgrade() {
			target.focused.fetch_add(1, Ordering::SeqCst);
		}
	}
}

/// A child frame as seen from `viewer`.
struct MemoryRelay {
	frame: MemoryWindow,
	viewer: MemoryWindow,
}

impl RelayFrame for MemoryRelay {
	fn name(&self) -> String {
		self.frame.inner.name.clone()
	}

	fn origin(&self) -> Option<String> {
		(self.frame.inner.origin == self.viewer.inner.origin).then(|| self.frame.inner.origin.clone())
	}

	fn endpoint(&self) -> Arc<dyn Endpoint> {
		self.viewer.endpoint_for(&self.frame)
	}

	fn do_post(&self, data: String, target_origin: &str) {
		if let Some(parent) = self.frame.parent() {
			parent.post(data, target_origin);
		}
	}

	fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
		self.frame.add_listener(listener)
	}

	fn remove_listener(&self, id: ListenerId) {
		self.frame.remove_listener(id);
	}

	fn remove(&self) {
		if let Some(parent) = self.frame.inner.parent.as_ref().and_then(Weak::upgrade) {
			MemoryWindow { inner: parent }.detach_frame(self.frame.inner.id);
		}
		self.frame.close();
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[derive(Default)]
	struct Inbox {
		seen: Mutex<Vec<Envelope>>,
		unloaded: AtomicBool,
	}

	impl Listener for Inbox {
		fn on_message(&self, envelope: &Envelope) {
			self.seen.lock().push(envelope.clone());
		}

		fn on_unload(&self) {
			self.unloaded.store(true, Ordering::SeqCst);
		}
	}

	async fn settle() {
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	#[tokio::test]
	async fn test_post_is_delivered_in_order_with_sender_origin() {
		let browser = MemoryBrowser::new().unwrap();
		let a = browser.open_window("https://a.example/index.html");
		let b = browser.open_window("https://b.example/");
		let inbox = Arc::new(Inbox::default());
		b.add_listener(inbox.clone());

		let to_b = a.endpoint_for(&b);
		to_b.post("one".into(), "https://b.example");
		to_b.post("two".into(), "*");
		assert!(inbox.seen.lock().is_empty());
		settle().await;

		let seen = inbox.seen.lock();
		assert_eq!(seen.len(), 2);
		assert_eq!(seen[0].data, "one");
		assert_eq!(seen[1].data, "two");
		assert_eq!(seen[0].origin, "https://a.example");
		assert_eq!(seen[0].source, a.id());
		assert_eq!(to_b.id(), b.id());
	}

	#[tokio::test]
	async fn test_target_origin_mismatch_is_dropped() {
		let browser = MemoryBrowser::new().unwrap();
		let a = browser.open_window("https://a.example/");
		let b = browser.open_window("https://b.example/");
		let inbox = Arc::new(Inbox::default());
		b.add_listener(inbox.clone());

		a.endpoint_for(&b).post("secret".into(), "https://c.example");
		settle().await;

		assert!(inbox.seen.lock().is_empty());
	}

	#[tokio::test]
	async fn test_close_fires_unload_and_drops_later_posts() {
		let browser = MemoryBrowser::new().unwrap();
		let a = browser.open_window("https://a.example/");
		let b = browser.open_window("https://b.example/");
		let inbox = Arc::new(Inbox::default());
		b.add_listener(inbox.clone());

		b.close();
		b.close();
		a.endpoint_for(&b).post("late".into(), "*");
		settle().await;

		assert!(inbox.unloaded.load(Ordering::SeqCst));
		assert!(inbox.seen.lock().is_empty());
		assert_eq!(b.listener_count(), 0);
	}

	#[tokio::test]
	async fn test_popup_runs_page_script_and_sees_opener() {
		let browser = MemoryBrowser::new().unwrap();
		let loaded = Arc::new(Mutex::new(None));
		let slot = loaded.clone();
		browser.page("https://idp.example/", move |popup| {
			*slot.lock() = popup.opener().map(|o| o.id());
		});

		let opener = browser.open_window("https://rp.example/");
		let popup = opener
			.open_popup("https://idp.example/sign_in", Some("width=10"))
			.unwrap();
		settle().await;

		assert_eq!(*loaded.lock(), Some(opener.id()));
		let popups = browser.popups();
		assert_eq!(popups.len(), 1);
		assert_eq!(popups[0].id(), popup.id());
		assert_eq!(popups[0].features(), Some("width=10"));
	}

	#[tokio::test]
	async fn test_blocked_popup() {
		let browser = MemoryBrowser::new().unwrap();
		browser.block_popups(true);
		let opener = browser.open_window("https://rp.example/");

		assert!(opener.open_popup("https://idp.example/", None).is_none());
		assert!(browser.popups().is_empty());
	}

	#[tokio::test]
	async fn test_closed_popups_pruned_on_next_open() {
		let browser = MemoryBrowser::new().unwrap();
		let opener = browser.open_window("https://rp.example/");

		let first = opener.open_popup("https://idp.example/a", None).unwrap();
		first.close();
		assert_eq!(browser.popups().len(), 1);
		assert!(browser.popups()[0].is_closed());

		let second = opener.open_popup("https://idp.example/b", None).unwrap();
		let popups = browser.popups();
		assert_eq!(popups.len(), 1);
		assert_eq!(popups[0].id(), second.id());
		assert!(!popups[0].is_closed());
	}

	#[tokio::test]
	async fn test_relay_frame_origin_visible_only_to_same_origin() {
		let browser = MemoryBrowser::new().unwrap();
		let opener = browser.open_window("https://rp.example/");
		let relay = opener
			.create_relay_frame("https://idp.example/relay", "relay")
			.unwrap();
		assert_eq!(relay.origin(), None);

		opener.open_popup("https://idp.example/popup", None).unwrap();
		let popup = browser.popups().remove(0);
		let frames = popup.opener_frames();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].name(), "relay");
		assert_eq!(frames[0].origin().as_deref(), Some("https://idp.example"));

		let inbox = Arc::new(Inbox::default());
		opener.add_listener(inbox.clone());
		frames[0].do_post("via relay".into(), "*");
		settle().await;
		assert_eq!(inbox.seen.lock()[0].origin, "https://idp.example");

		relay.remove();
		assert!(opener.frames().is_empty());
		assert!(popup.opener_frames().is_empty());
	}
}
