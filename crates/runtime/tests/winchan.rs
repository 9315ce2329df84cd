mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{as_window, init_tracing, settle};
use parking_lot::Mutex;
use postchan::protocol::{CLIENT_CLOSED_WINDOW, DEFAULT_POPUP_FEATURES, PopupOptions, RELAY_FRAME_NAME};
use postchan::{
	Capabilities, Endpoint, Error, ExchangePhase, MemoryBrowser, MemoryWindow, Responder, Result,
	on_open, open,
};
use serde_json::{Value, json};
use tokio::sync::oneshot;

const OPENER_URL: &str = "https://rp.example/login";
const POPUP_URL: &str = "https://idp.example/sign_in";
const RELAY_URL: &str = "https://idp.example/relay";

fn browser() -> MemoryBrowser {
	init_tracing();
	MemoryBrowser::new().unwrap()
}

/// Serves every popup with a handler answering `{"seen": arg, "from": origin}`.
fn serve_echo(browser: &MemoryBrowser) {
	browser.page("https://idp.example/", |popup: MemoryWindow| {
		on_open(as_window(&popup), |origin, arg, responder| {
			responder
				.respond(json!({"seen": arg, "from": origin}))
				.unwrap();
		})
		.unwrap();
	});
}

/// Serves every popup with a handler that parks its responder.
fn serve_parked(browser: &MemoryBrowser) -> Arc<Mutex<Option<Responder>>> {
	let slot = Arc::new(Mutex::new(None));
	let parked = slot.clone();
	browser.page("https://idp.example/", move |popup: MemoryWindow| {
		let parked = parked.clone();
		on_open(as_window(&popup), move |_, _, responder| {
			*parked.lock() = Some(responder);
		})
		.unwrap();
	});
	slot
}

fn start(
	opener: &MemoryWindow,
	options: PopupOptions,
) -> (Option<postchan::PopupHandle>, oneshot::Receiver<Result<Value>>) {
	let (tx, rx) = oneshot::channel();
	let handle = open(as_window(opener), options, move |result| {
		let _ = tx.send(result);
	});
	(handle, rx)
}

async fn outcome(rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
	tokio::time::timeout(Duration::from_secs(2), rx)
		.await
		.expect("exchange did not finish")
		.expect("callback dropped")
}

#[tokio::test]
async fn test_direct_exchange_completes() {
	let browser = browser();
	serve_echo(&browser);
	let opener = browser.open_window(OPENER_URL);

	let (handle, rx) = start(
		&opener,
		PopupOptions::new(POPUP_URL, RELAY_URL).arg(json!({"audience": "rp"})),
	);
	let handle = handle.unwrap();
	assert_eq!(handle.phase(), ExchangePhase::Opening);

	let result = outcome(rx).await.unwrap();
	assert_eq!(
		result,
		json!({"seen": {"audience": "rp"}, "from": "https://rp.example"})
	);
	assert_eq!(handle.phase(), ExchangePhase::Completed);

	let popup = browser.popups().remove(0);
	assert!(popup.is_closed());
	assert_eq!(popup.features(), Some(DEFAULT_POPUP_FEATURES));
	assert_eq!(opener.listener_count(), 0);
}

#[tokio::test]
async fn test_relay_exchange_completes_and_removes_frame() {
	let browser = browser();
	browser.set_capabilities(Capabilities {
		relay: true,
		..Capabilities::default()
	});
	serve_echo(&browser);
	let opener = browser.open_window(OPENER_URL);

	let (handle, rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL).arg(json!(7)));
	let frames = opener.frames();
	assert_eq!(frames.len(), 1);
	assert_eq!(frames[0].name(), RELAY_FRAME_NAME);
	assert_eq!(frames[0].url(), RELAY_URL);

	let result = outcome(rx).await.unwrap();
	assert_eq!(result["seen"], json!(7));
	assert_eq!(handle.unwrap().phase(), ExchangePhase::Completed);
	assert!(opener.frames().is_empty());
	assert!(frames[0].is_closed());
}

#[tokio::test]
async fn test_origin_mismatch_fails_asynchronously() {
	let browser = browser();
	let opener = browser.open_window(OPENER_URL);
	let fired = Arc::new(AtomicBool::new(false));

	let (tx, rx) = oneshot::channel();
	let flag = fired.clone();
	let handle = open(
		as_window(&opener),
		PopupOptions::new(POPUP_URL, "https://other.example/relay"),
		move |result| {
			flag.store(true, Ordering::SeqCst);
			let _ = tx.send(result);
		},
	);

	assert!(handle.is_none());
	assert!(!fired.load(Ordering::SeqCst));

	let err = outcome(rx).await.unwrap_err();
	assert!(matches!(err, Error::OriginMismatch { .. }));
	assert_eq!(
		err.to_string(),
		"invalid arguments: origin of url and relay_url must match"
	);
	assert!(browser.popups().is_empty());
	assert!(opener.frames().is_empty());
}

#[test]
fn test_setup_failure_deferred_outside_async_context() {
	let runtime = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()
		.unwrap();
	let browser = {
		let _guard = runtime.enter();
		browser()
	};
	let opener = browser.open_window(OPENER_URL);
	let fired = Arc::new(AtomicBool::new(false));

	let (tx, rx) = oneshot::channel();
	let flag = fired.clone();
	let handle = open(
		as_window(&opener),
		PopupOptions::new(POPUP_URL, "https://other.example/relay"),
		move |result| {
			flag.store(true, Ordering::SeqCst);
			let _ = tx.send(result);
		},
	);

	assert!(handle.is_none());
	assert!(!fired.load(Ordering::SeqCst));
	let err = runtime.block_on(outcome(rx)).unwrap_err();
	assert!(matches!(err, Error::OriginMismatch { .. }));
	assert!(fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_user_closing_popup_reports_client_closed_window() {
	let browser = browser();
	let _parked = serve_parked(&browser);
	let opener = browser.open_window(OPENER_URL);

	let (handle, rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL));
	let handle = handle.unwrap();
	settle().await;
	assert_eq!(handle.phase(), ExchangePhase::WaitingResponse);

	handle.close();

	let err = outcome(rx).await.unwrap_err();
	assert_eq!(err.to_string(), CLIENT_CLOSED_WINDOW);
	assert_eq!(handle.phase(), ExchangePhase::ClosedByUser);
}

#[tokio::test]
async fn test_parked_response_and_foreign_origin_ignored() {
	let browser = browser();
	let parked = serve_parked(&browser);
	let opener = browser.open_window(OPENER_URL);
	let impostor = opener.add_frame("https://evil.example/", "evil").unwrap();

	let (handle, rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL));
	let handle = handle.unwrap();
	settle().await;

	impostor
		.parent()
		.unwrap()
		.post(r#"{"a":"response","d":"forged"}"#.to_string(), "*");
	settle().await;
	assert_eq!(handle.phase(), ExchangePhase::WaitingResponse);

	let responder = parked.lock().take().unwrap();
	assert_eq!(responder.origin(), "https://rp.example");
	responder.respond(json!("genuine")).unwrap();

	assert_eq!(outcome(rx).await.unwrap(), json!("genuine"));
}

#[tokio::test]
async fn test_unsupported_environment() {
	let browser = browser();
	browser.set_capabilities(Capabilities {
		supported: false,
		..Capabilities::default()
	});
	let opener = browser.open_window(OPENER_URL);

	let (handle, rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL));
	assert!(handle.is_none());
	assert!(matches!(outcome(rx).await, Err(Error::Unsupported)));

	let result = on_open(as_window(&opener), |_, _, _| {});
	assert!(matches!(result, Err(Error::Unsupported)));
}

#[tokio::test]
async fn test_blocked_popup_releases_everything() {
	let browser = browser();
	browser.set_capabilities(Capabilities {
		relay: true,
		..Capabilities::default()
	});
	browser.block_popups(true);
	let opener = browser.open_window(OPENER_URL);

	let (handle, rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL));
	assert!(handle.is_none());
	assert!(matches!(outcome(rx).await, Err(Error::PopupBlocked)));
	assert_eq!(opener.listener_count(), 0);
	assert!(opener.frames().is_empty());
}

#[tokio::test]
async fn test_popup_features_dropped_when_ignored() {
	let browser = browser();
	browser.set_capabilities(Capabilities {
		ignore_popup_features: true,
		..Capabilities::default()
	});
	let opener = browser.open_window(OPENER_URL);

	let (handle, _rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL));
	assert!(handle.is_some());
	assert_eq!(browser.popups()[0].features(), None);
}

#[tokio::test]
async fn test_on_open_requires_opener_and_relay() {
	let browser = browser();
	let lonely = browser.open_window(POPUP_URL);
	assert!(matches!(
		on_open(as_window(&lonely), |_, _, _| {}),
		Err(Error::NoOpener)
	));

	browser.set_capabilities(Capabilities {
		relay: true,
		..Capabilities::default()
	});
	let opener = browser.open_window(OPENER_URL);
	postchan::Window::open_popup(&opener, POPUP_URL, None).unwrap();
	let popup = browser.popups().remove(0);
	assert!(matches!(
		on_open(as_window(&popup), |_, _, _| {}),
		Err(Error::RelayNotFound)
	));

	// a frame with the right name but another origin is not trusted
	opener.add_frame("https://evil.example/relay", RELAY_FRAME_NAME).unwrap();
	assert!(matches!(
		on_open(as_window(&popup), |_, _, _| {}),
		Err(Error::RelayNotFound)
	));
}

#[tokio::test]
async fn test_opener_unload_abandons_exchange() {
	let browser = browser();
	let _parked = serve_parked(&browser);
	let opener = browser.open_window(OPENER_URL);
	let fired = Arc::new(AtomicBool::new(false));

	let flag = fired.clone();
	let handle = open(as_window(&opener), PopupOptions::new(POPUP_URL, RELAY_URL), move |_| {
		flag.store(true, Ordering::SeqCst);
	})
	.unwrap();
	settle().await;

	postchan::Window::close(&opener);
	settle().await;

	assert_eq!(handle.phase(), ExchangePhase::Abandoned);
	assert!(!fired.load(Ordering::SeqCst));
	assert!(browser.popups()[0].is_closed());
}

#[tokio::test]
async fn test_focus_reaches_popup() {
	let browser = browser();
	let opener = browser.open_window(OPENER_URL);

	let (handle, _rx) = start(&opener, PopupOptions::new(POPUP_URL, RELAY_URL));
	let handle = handle.unwrap();
	handle.focus();
	handle.focus();

	assert_eq!(browser.popups()[0].focus_count(), 2);
	assert_eq!(handle.origin(), "https://idp.example");
}
