//! Inbound transactions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use postchan_protocol::{Callback, ErrorReply, Message, Response};
use serde_json::Value;

use super::ChannelInner;
use crate::error::{Error, Result};

struct TransactionInner {
	id: u64,
	origin: String,
	callbacks: Vec<String>,
	channel: Weak<ChannelInner>,
	completed: AtomicBool,
	delayed: AtomicBool,
}

/// Context handed to a request handler.
///
/// Exactly one of [`complete`](Self::complete) or [`error`](Self::error)
/// takes effect; the second attempt fails with
/// [`Error::ProtocolViolation`] and sends nothing. Clone it into another task
/// together with [`delay_return(true)`](Self::delay_return) to answer
/// asynchronously.
#[derive(Clone)]
pub struct Transaction {
	inner: Arc<TransactionInner>,
}

impl Transaction {
	pub(crate) fn new(id: u64, origin: String, callbacks: Vec<String>, channel: Weak<ChannelInner>) -> Self {
		Self {
			inner: Arc::new(TransactionInner {
				id,
				origin,
				callbacks,
				channel,
				completed: AtomicBool::new(false),
				delayed: AtomicBool::new(false),
			}),
		}
	}

	pub fn id(&self) -> u64 {
		self.inner.id
	}

	/// Origin the request came from.
	pub fn origin(&self) -> &str {
		&self.inner.origin
	}

	/// Callback paths declared by the caller.
	pub fn callbacks(&self) -> &[String] {
		&self.inner.callbacks
	}

	/// Invokes a callback declared by the caller.
	pub fn invoke(&self, callback: &str, params: Value) -> Result<()> {
		let channel = self.channel()?;
		if self.is_completed() {
			return Err(Error::ProtocolViolation(format!(
				"attempting to invoke a callback of a completed transaction: {}",
				self.inner.id
			)));
		}
		if !self.inner.callbacks.iter().any(|c| c == callback) {
			return Err(Error::InvalidCallback(callback.to_string()));
		}
		channel.send_callback(
			self.inner.id,
			Message::Callback(Callback {
				id: self.inner.id,
				callback: callback.to_string(),
				params: Some(params),
			}),
		)
	}

	/// Fails the request.
	pub fn error(&self, code: impl Into<String>, message: impl Into<String>) -> Result<()> {
		self.finish(Message::Error(ErrorReply {
			id: self.inner.id,
			error: code.into(),
			message: Some(message.into()),
		}))
	}

	/// Answers the request.
	pub fn complete(&self, result: Value) -> Result<()> {
		self.finish(Message::Response(Response {
			id: self.inner.id,
			result: Some(result),
		}))
	}

	/// Opts out of completing with the handler's return value.
	pub fn delay_return(&self, delay: bool) {
		self.inner.delayed.store(delay, Ordering::SeqCst);
	}

	pub fn is_delayed(&self) -> bool {
		self.inner.delayed.load(Ordering::SeqCst)
	}

	pub fn is_completed(&self) -> bool {
		self.inner.completed.load(Ordering::SeqCst)
	}

	fn finish(&self, message: Message) -> Result<()> {
		let channel = self.channel()?;
		if self.inner.completed.swap(true, Ordering::SeqCst) {
			return Err(Error::ProtocolViolation(format!(
				"transaction {} already completed",
				self.inner.id
			)));
		}
		channel.finish_inbound(self.inner.id, message)
	}

	fn channel(&self) -> Result<Arc<ChannelInner>> {
		self.inner.channel.upgrade().ok_or(Error::ChannelDestroyed)
	}
}

impl fmt::Debug for Transaction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Transaction")
			.field("id", &self.inner.id)
			.field("origin", &self.inner.origin)
			.field("callbacks", &self.inner.callbacks)
			.field("completed", &self.is_completed())
			.finish()
	}
}
