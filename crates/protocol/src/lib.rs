//! Wire types for postchan.
//!
//! Two protocols share a cross-context, origin-tagged string transport:
//!
//! - the **channel** protocol ([`Message`]): requests, responses, errors,
//!   callback invocations and notifications, correlated by integer ids and
//!   namespaced by an optional scope (`"scope::method"`);
//! - the **popup handshake** ([`WinChanMessage`]): a four-verb exchange used
//!   for one request and one response with a freshly opened window.
//!
//! Types in this crate are pure data. Routing, transaction bookkeeping and
//! window management live in `postchan-runtime`.

pub mod message;
pub mod options;
pub mod origin;
pub mod winchan;

pub use message::*;
pub use options::*;
pub use origin::{ANY_ORIGIN, extract_origin, normalize_origin};
pub use winchan::*;
