//! Outbound calls.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::ChannelInner;
use crate::error::{Error, Result};

/// Callback the remote handler may invoke while a call is open.
pub type CallbackFn = Arc<dyn Fn(Value) + Send + Sync>;

/// A request to be sent with [`Channel::call`](super::Channel::call).
///
/// Callbacks are declared explicitly by path. The paths travel in the
/// request's `callbacks` array; the functions stay local and are reachable
/// only through the outbound transaction.
pub struct Call {
	pub(crate) method: String,
	pub(crate) params: Value,
	pub(crate) callbacks: Vec<(String, CallbackFn)>,
	pub(crate) timeout: Option<Duration>,
}

impl Call {
	pub fn new(method: impl Into<String>, params: Value) -> Self {
		Self {
			method: method.into(),
			params,
			callbacks: Vec::new(),
			timeout: None,
		}
	}

	/// Declares a callback under `path` (e.g. `"upload/onProgress"`).
	pub fn callback<F>(mut self, path: impl Into<String>, callback: F) -> Self
	where
		F: Fn(Value) + Send + Sync + 'static,
	{
		self.callbacks.push((path.into(), Arc::new(callback)));
		self
	}

	/// Fails the call with a timeout error if no reply arrives in time.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub(crate) fn validate_callbacks(&self) -> Result<()> {
		let mut seen = HashSet::new();
		for (path, _) in &self.callbacks {
			if path.is_empty() {
				return Err(Error::InvalidArgument("callback path must not be empty".into()));
			}
			if !seen.insert(path.as_str()) {
				return Err(Error::InvalidArgument(format!(
					"callback '{path}' declared twice"
				)));
			}
		}
		Ok(())
	}
}

impl fmt::Debug for Call {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Call")
			.field("method", &self.method)
			.field("params", &self.params)
			.field(
				"callbacks",
				&self.callbacks.iter().map(|(p, _)| p).collect::<Vec<_>>(),
			)
			.field("timeout", &self.timeout)
			.finish()
	}
}

/// Abandons the transaction if the caller stops waiting for it.
struct CancelGuard {
	id: u64,
	channel: Weak<ChannelInner>,
	completed: bool,
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		if let Some(channel) = self.channel.upgrade() {
			channel.abandon(self.id);
		}
	}
}

/// Future resolving to the reply of an outbound call.
///
/// Resolves with the result on success, [`Error::Remote`] when the handler
/// failed, [`Error::Timeout`] when the deadline passed and
/// [`Error::ChannelDestroyed`] when the channel went away first. Dropping it
/// abandons the transaction; a late reply is then ignored.
pub struct PendingCall {
	rx: oneshot::Receiver<Result<Value>>,
	guard: CancelGuard,
}

impl PendingCall {
	pub(crate) fn new(id: u64, rx: oneshot::Receiver<Result<Value>>, channel: Weak<ChannelInner>) -> Self {
		Self {
			rx,
			guard: CancelGuard {
				id,
				channel,
				completed: false,
			},
		}
	}

	/// Transaction id of the request.
	pub fn id(&self) -> u64 {
		self.guard.id
	}
}

impl Future for PendingCall {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.completed = true;
				Poll::Ready(result.map_err(|_| Error::ChannelDestroyed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl fmt::Debug for PendingCall {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PendingCall").field("id", &self.guard.id).finish()
	}
}
