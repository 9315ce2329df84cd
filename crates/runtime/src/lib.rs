//! postchan runtime: RPC channels and popup handshakes over cross-context
//! message transports.
//!
//! - **Dispatcher**: one per execution context; parses inbound payloads and
//!   routes them to channels by origin, scope and sending endpoint, or to the
//!   awaiting call by transaction id
//! - **Channel**: request/response, callbacks, notifications and timeouts with
//!   one remote endpoint, gated by a ready handshake
//! - **WinChan**: one request and one response with a freshly opened popup,
//!   optionally through a relay frame
//! - **Memory transport**: in-process windows for tests and embedding
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐
//! │   Channel    │     │   winchan    │
//! └──────┬───────┘     └──────┬───────┘
//!        │ Route              │ Listener
//! ┌──────▼───────┐            │
//! │  Dispatcher  │            │
//! └──────┬───────┘            │
//!        │ Listener           │
//! ┌──────▼────────────────────▼───────┐
//! │  Window / Endpoint / RelayFrame   │  host transport (memory or embedder)
//! └───────────────────────────────────┘
//! ```
//!
//! Wire types live in `postchan-protocol`.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod transport;
pub mod winchan;
pub mod window;

pub use channel::{
	Call, CallbackFn, Channel, ChannelConfig, ChannelState, Handler, MessageObserver, PendingCall,
	ReadyHook, Transaction,
};
pub use dispatcher::{Dispatcher, Route};
pub use error::{Error, RemoteError, Result};
pub use memory::{MemoryBrowser, MemoryWindow, PageScript};
pub use postchan_protocol as protocol;
pub use transport::{Endpoint, EndpointId, Envelope, Listener, ListenerId};
pub use winchan::{ExchangePhase, PopupHandle, Responder, on_open, open};
pub use window::{Capabilities, RelayFrame, Window};
