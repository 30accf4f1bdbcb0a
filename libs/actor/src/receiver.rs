//! Receiver trait and key bounds.

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::ReceiverError;

/// Marker trait for dispatcher keys.
pub trait DispatchKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> DispatchKey for T {}

/// Marker trait for messages.
pub trait Message: Send + 'static {}

impl<T: Send + 'static> Message for T {}

/// Handler bound to a key.
///
/// Receivers registered without concurrent draining see one call at a time,
/// in post order. Concurrent receivers may be called from several threads at
/// once, which is why every hook takes `&self`.
///
/// Errors and panics from any hook are logged and counted; the next message
/// is still delivered.
pub trait Receiver<M>: Send + Sync + 'static {
    /// Handle one message.
    fn receive(&self, message: M) -> Result<(), ReceiverError>;

    /// Called once, before the first message.
    fn on_start(&self) -> Result<(), ReceiverError> {
        Ok(())
    }

    /// Called once, after the last message.
    fn on_stop(&self) -> Result<(), ReceiverError> {
        Ok(())
    }
}

/// Receiver backed by a closure.
pub struct FnReceiver<F>(F);

/// Wrap a closure as a [`Receiver`] with no-op lifecycle hooks.
pub fn receiver_fn<M, F>(f: F) -> FnReceiver<F>
where
    F: Fn(M) -> Result<(), ReceiverError> + Send + Sync + 'static,
{
    FnReceiver(f)
}

impl<M, F> Receiver<M> for FnReceiver<F>
where
    F: Fn(M) -> Result<(), ReceiverError> + Send + Sync + 'static,
{
    fn receive(&self, message: M) -> Result<(), ReceiverError> {
        (self.0)(message)
    }
}
