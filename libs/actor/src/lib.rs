//! # courier-actor
//!
//! Keyed message dispatch on top of `courier-executor`.
//!
//! Receivers are registered under a key and addressed only through it. Each
//! key owns a [`Mailbox`]; messages to one key are delivered in post order,
//! and unless the receiver opted into concurrent draining, never by two
//! threads at once.
//!
//! ## Strategies
//!
//! - [`Dispatcher`]: a fixed set of message loops drains whichever mailboxes
//!   have work. Receivers should not block.
//! - [`PinnedDispatcher`]: every key gets its own logical loop, scheduled onto
//!   a shared pool only while it has messages. Receivers may block.
//!
//! Both implement [`MessageDispatcher`], so callers can hold either behind
//! `Arc<dyn MessageDispatcher<K, M>>`.
//!
//! ## Failure Policy
//!
//! A receiver error or panic is logged and counted in [`DispatchStats`];
//! delivery continues with the next message. Posting to an unknown key or a
//! closed dispatcher is a silent no-op; registering after close fails.

mod config;
mod dispatcher;
mod error;
pub mod mailbox;
mod pinned;
mod receiver;
mod registry;
mod stats;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, MessageDispatcher};
pub use error::{DispatchError, ReceiverError};
pub use mailbox::{InboxMessage, Mailbox, ProcessOutcome};
pub use pinned::PinnedDispatcher;
pub use receiver::{receiver_fn, DispatchKey, FnReceiver, Message, Receiver};
pub use stats::DispatchStats;
