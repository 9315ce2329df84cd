#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use postchan::{Dispatcher, MemoryBrowser, MemoryWindow, Window};
use tracing_subscriber::EnvFilter;

pub const PARENT_URL: &str = "https://rp.example/index.html";
pub const CHILD_URL: &str = "https://widget.example/frame.html";

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
		.with_test_writer()
		.try_init();
}

/// Lets every window pump drain its inbox.
pub async fn settle() {
	tokio::time::sleep(Duration::from_millis(25)).await;
}

pub fn as_window(window: &MemoryWindow) -> Arc<dyn Window> {
	Arc::new(window.clone())
}

/// A page hosting one child frame, each with its own attached dispatcher.
pub struct FramePair {
	pub browser: MemoryBrowser,
	pub parent: MemoryWindow,
	pub child: MemoryWindow,
	pub parent_dispatcher: Dispatcher,
	pub child_dispatcher: Dispatcher,
}

impl FramePair {
	pub fn new() -> Self {
		init_tracing();
		let browser = MemoryBrowser::new().unwrap();
		let parent = browser.open_window(PARENT_URL);
		let child = parent.add_frame(CHILD_URL, "widget").unwrap();
		let parent_dispatcher = Dispatcher::attach(&as_window(&parent));
		let child_dispatcher = Dispatcher::attach(&as_window(&child));
		Self {
			browser,
			parent,
			child,
			parent_dispatcher,
			child_dispatcher,
		}
	}
}
