//! Task types and result handles.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::ExecutorError;

/// A unit of work executed on a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the eventual result of a submitted task.
///
/// Blocking callers use [`TaskHandle::join`]; async callers `.await` the handle
/// directly. Dropping the handle does not cancel the task.
#[must_use = "dropping a TaskHandle discards the task's result"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, ExecutorError>>,
}

impl<T> TaskHandle<T> {
    /// Block the current thread until the task finishes.
    ///
    /// Must not be called from inside an async runtime; `.await` the handle
    /// there instead.
    pub fn join(self) -> Result<T, ExecutorError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(ExecutorError::Cancelled))
    }

    /// Return the result if the task has already finished.
    pub fn try_join(&mut self) -> Option<Result<T, ExecutorError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ExecutorError::Cancelled)),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, ExecutorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ExecutorError::Cancelled)))
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

/// Wrap a closure into a [`Task`] that reports its outcome to a [`TaskHandle`].
pub(crate) fn with_handle<F, T>(f: F) -> (Task, TaskHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task: Task = Box::new(move || {
        let result = run_catching(f);
        if let Err(e) = &result {
            warn!(error = %e, "Submitted task failed");
        }
        // The caller may have dropped the handle.
        let _ = tx.send(result);
    });
    (task, TaskHandle { rx })
}

/// Run a closure, converting a panic into [`ExecutorError::TaskPanicked`].
pub fn run_catching<F, T>(f: F) -> Result<T, ExecutorError>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| ExecutorError::TaskPanicked(panic_message(payload.as_ref())))
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_receives_result() {
        let (task, handle) = with_handle(|| 21 * 2);
        task();
        assert_eq!(handle.join(), Ok(42));
    }

    #[test]
    fn test_panic_is_reported() {
        let (task, handle) = with_handle(|| -> u32 { panic!("kaboom") });
        task();
        assert_eq!(
            handle.join(),
            Err(ExecutorError::TaskPanicked("kaboom".to_string()))
        );
    }

    #[test]
    fn test_dropped_task_reports_cancelled() {
        let (task, handle) = with_handle(|| 1);
        drop(task);
        assert_eq!(handle.join(), Err(ExecutorError::Cancelled));
    }

    #[test]
    fn test_try_join_before_and_after() {
        let (task, mut handle) = with_handle(|| "done");
        assert!(handle.try_join().is_none());
        task();
        assert_eq!(handle.try_join(), Some(Ok("done")));
    }

    #[test]
    fn test_panic_message_formats() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_handle_is_awaitable() {
        let (task, handle) = with_handle(|| vec![1, 2, 3]);
        std::thread::spawn(task);
        assert_eq!(handle.await, Ok(vec![1, 2, 3]));
    }
}
