//! # Streaming Core
//!
//! Type-generic building blocks for change-data-capture streaming:
//!
//! - **Key sets**: range-encoded primary-key sets and reconciliation
//! - **Messages**: entity snapshots, change events, prepared frames
//! - **Publisher / Subscription**: per-type fan-out with per-subscriber filters
//! - **Streamer**: per-connection outbound queue with a single writer

pub mod errors;
pub mod keyset;
pub mod msg;
pub mod publisher;
pub mod streamer;

pub use errors::{StreamError, StreamResult};
pub use keyset::{reconcile, Reconciled};
pub use msg::{Event, MessageKind, Msg, PreparedMessage};
pub use publisher::{all_of, filter_fn, BroadcastStats, Filter, Publisher, Subscription};
pub use streamer::{Outbox, Streamer, Wakeup};
