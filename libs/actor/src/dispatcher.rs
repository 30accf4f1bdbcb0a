//! Shared-pool dispatcher.
//!
//! A fixed set of message loops pulls ready mailboxes from one pending queue
//! and drains them. A mailbox is pushed whenever work becomes available
//! (register, post, unregister); duplicates are harmless because draining
//! stops early when the mailbox is empty or held by another loop.
//!
//! Shutdown is cooperative: `close` queues `OnStop` for every receiver and
//! then a sentinel. A loop that takes the sentinel puts it back for its
//! siblings and exits once nothing else is pending.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_executor::{run_catching, ExecutionContext, TaskQueue};
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::mailbox::{Mailbox, ProcessOutcome};
use crate::receiver::{DispatchKey, Message, Receiver};
use crate::registry::Registry;
use crate::stats::DispatchStats;

// =============================================================================
// Dispatcher Trait
// =============================================================================

/// Common contract of the dispatch strategies.
pub trait MessageDispatcher<K, M>: Send + Sync {
    /// Bind `receiver` to `key`. `OnStart` is delivered before any message.
    fn register(
        &self,
        key: K,
        receiver: Arc<dyn Receiver<M>>,
        enable_concurrent: bool,
    ) -> Result<(), DispatchError>;

    /// Queue `OnStop` for the key. The key can be registered again once it
    /// has been delivered. Returns false for unknown or already stopping keys.
    fn unregister(&self, key: &K) -> bool;

    /// Queue a message for the key. Silently dropped if the key is unknown,
    /// stopping, or the dispatcher is closed.
    fn post_message(&self, key: &K, message: M);

    /// Stop every receiver and the worker pool. Idempotent.
    fn close(&self);

    /// Wait until every queued message and stop signal was delivered and the
    /// worker threads exited. Only meaningful after [`close`](Self::close).
    fn await_termination(&self, timeout: Duration) -> bool;

    fn is_registered(&self, key: &K) -> bool;

    fn stats(&self) -> DispatchStats;
}

// =============================================================================
// Shared-Pool Dispatcher
// =============================================================================

enum Pending<K, M> {
    Mailbox(Arc<Mailbox<K, M>>),
    Shutdown,
}

struct Shared<K, M> {
    registry: Registry<K, M>,
    pending: TaskQueue<Pending<K, M>>,
    throughput: Option<usize>,
    max_loop_restarts: u32,
    loop_restarts: AtomicU32,
}

/// Dispatcher draining mailboxes on a fixed set of shared message loops.
pub struct Dispatcher<K, M> {
    shared: Arc<Shared<K, M>>,
    context: ExecutionContext,
}

impl<K: DispatchKey, M: Message> Dispatcher<K, M> {
    /// Start a dispatcher with `config.worker_threads` message loops.
    pub fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        config.validate()?;

        let context = ExecutionContext::with_threads(&config.name, config.worker_threads)?;
        let shared = Arc::new(Shared {
            registry: Registry::new(&config.name),
            pending: TaskQueue::new(),
            throughput: config.throughput,
            max_loop_restarts: config.max_loop_restarts,
            loop_restarts: AtomicU32::new(0),
        });

        for index in 0..config.worker_threads {
            let shared = Arc::clone(&shared);
            context.execute(move || {
                supervise_loop(&shared, index);
            })?;
        }

        info!(
            dispatcher = %config.name,
            worker_threads = config.worker_threads,
            throughput = ?config.throughput,
            "Dispatcher started"
        );

        Ok(Self { shared, context })
    }

    /// Number of registered keys, including ones still stopping.
    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry.is_closed()
    }

    /// Message loops restarted after crashing.
    pub fn loop_restarts(&self) -> u32 {
        self.shared.loop_restarts.load(Ordering::Relaxed)
    }

    fn enqueue(&self, mailbox: Arc<Mailbox<K, M>>) {
        if self.shared.pending.push(Pending::Mailbox(mailbox)).is_err() {
            warn!(dispatcher = %self.shared.registry.name(), "Pending queue closed");
        }
    }
}

impl<K: DispatchKey, M: Message> MessageDispatcher<K, M> for Dispatcher<K, M> {
    fn register(
        &self,
        key: K,
        receiver: Arc<dyn Receiver<M>>,
        enable_concurrent: bool,
    ) -> Result<(), DispatchError> {
        let mailbox = self.shared.registry.register(key, receiver, enable_concurrent)?;
        self.enqueue(mailbox);
        Ok(())
    }

    fn unregister(&self, key: &K) -> bool {
        match self.shared.registry.unregister(key) {
            Some(mailbox) => {
                self.enqueue(mailbox);
                true
            }
            None => false,
        }
    }

    fn post_message(&self, key: &K, message: M) {
        if let Some(mailbox) = self.shared.registry.post(key, message) {
            self.enqueue(mailbox);
        }
    }

    fn close(&self) {
        let Some(closing) = self.shared.registry.close() else {
            return;
        };
        for mailbox in closing {
            self.enqueue(mailbox);
        }
        let _ = self.shared.pending.push(Pending::Shutdown);
        self.context.shutdown();
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.context.await_termination(timeout)
    }

    fn is_registered(&self, key: &K) -> bool {
        self.shared.registry.contains(key)
    }

    fn stats(&self) -> DispatchStats {
        self.shared.registry.stats()
    }
}

impl<K, M> Drop for Dispatcher<K, M> {
    fn drop(&mut self) {
        // Without close the loops would park on the pending queue forever.
        self.shared.pending.close();
    }
}

impl<K, M> std::fmt::Debug for Dispatcher<K, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("context", &self.context)
            .field("pending", &self.shared.pending.len())
            .field("throughput", &self.shared.throughput)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Message Loop
// =============================================================================

/// Run a message loop, restarting it after a crash while the restart budget
/// lasts. Returns the number of restarts this loop used.
fn supervise_loop<K: DispatchKey, M: Message>(shared: &Shared<K, M>, index: usize) -> u32 {
    supervise(&shared.loop_restarts, shared.max_loop_restarts, index, || {
        message_loop(shared, index)
    })
}

fn supervise<F: FnMut()>(restarts: &AtomicU32, max_restarts: u32, index: usize, mut body: F) -> u32 {
    let mut used = 0;
    loop {
        match run_catching(&mut body) {
            Ok(()) => return used,
            Err(e) => {
                let total = restarts.fetch_add(1, Ordering::AcqRel) + 1;
                if total > max_restarts {
                    error!(worker = index, error = %e, restarts = total - 1, "Message loop crashed; restart budget exhausted");
                    return used;
                }
                used += 1;
                warn!(worker = index, error = %e, restarts = total, "Message loop crashed; restarting");
            }
        }
    }
}

fn message_loop<K: DispatchKey, M: Message>(shared: &Shared<K, M>, index: usize) {
    debug!(worker = index, "Message loop started");
    while let Some(pending) = shared.pending.take() {
        match pending {
            Pending::Shutdown => {
                let more = !shared.pending.is_empty();
                let _ = shared.pending.push(Pending::Shutdown);
                if !more {
                    break;
                }
            }
            Pending::Mailbox(mailbox) => match mailbox.process(shared.throughput) {
                ProcessOutcome::Yielded => {
                    if let Err(Pending::Mailbox(mailbox)) =
                        shared.pending.push(Pending::Mailbox(mailbox))
                    {
                        // Pending queue closed by drop: finish the mailbox here.
                        if mailbox.process(None) == ProcessOutcome::Terminated {
                            shared.registry.remove_terminated(&mailbox);
                        }
                    }
                }
                ProcessOutcome::Terminated => shared.registry.remove_terminated(&mailbox),
                ProcessOutcome::Busy | ProcessOutcome::Idle => {}
            },
        }
    }
    debug!(worker = index, "Message loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReceiverError;
    use crate::receiver::receiver_fn;
    use courier_testing::{wait_until, Recorder, DEFAULT_TIMEOUT};
    use std::sync::atomic::AtomicBool;

    fn dispatcher(threads: usize) -> Dispatcher<String, u32> {
        Dispatcher::new(
            &DispatcherConfig::default()
                .with_name("test-dispatch")
                .with_worker_threads(threads),
        )
        .unwrap()
    }

    #[test]
    fn test_supervise_restarts_within_budget() {
        let restarts = AtomicU32::new(0);
        let mut calls = 0;
        let used = supervise(&restarts, 5, 0, || {
            calls += 1;
            if calls < 3 {
                panic!("loop crash");
            }
        });
        assert_eq!(used, 2);
        assert_eq!(calls, 3);
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_supervise_gives_up() {
        let restarts = AtomicU32::new(0);
        let mut calls = 0;
        let used = supervise(&restarts, 1, 0, || {
            calls += 1;
            panic!("always crashes");
        });
        assert_eq!(used, 1);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_post_to_unknown_key_is_dropped() {
        let dispatcher = dispatcher(2);
        dispatcher.post_message(&"nobody".to_string(), 1);
        assert_eq!(dispatcher.stats().dropped, 1);
        assert_eq!(dispatcher.stats().posted, 0);
        dispatcher.close();
        assert!(dispatcher.await_termination(DEFAULT_TIMEOUT));
    }

    #[test]
    fn test_register_after_close_fails() {
        let dispatcher = dispatcher(1);
        dispatcher.close();
        let result = dispatcher.register(
            "late".to_string(),
            Arc::new(receiver_fn(|_: u32| Ok(()))),
            false,
        );
        assert!(matches!(result, Err(DispatchError::DispatcherClosed)));
        assert!(dispatcher.is_closed());
    }

    #[test]
    fn test_unregister_removes_after_stop() {
        let dispatcher = dispatcher(2);
        let seen = Recorder::new();
        let sink = seen.clone();
        dispatcher
            .register(
                "a".to_string(),
                Arc::new(receiver_fn(move |n: u32| {
                    sink.record(n);
                    Ok(())
                })),
                false,
            )
            .unwrap();
        dispatcher.post_message(&"a".to_string(), 1);

        assert!(dispatcher.unregister(&"a".to_string()));
        assert!(!dispatcher.unregister(&"a".to_string()));
        assert!(wait_until(DEFAULT_TIMEOUT, || !dispatcher.is_registered(&"a".to_string())));
        assert_eq!(seen.snapshot(), vec![1]);

        dispatcher.close();
        assert!(dispatcher.await_termination(DEFAULT_TIMEOUT));
    }

    /// Key whose next hash panics once `trap` is set.
    #[derive(Debug, Clone)]
    struct TrapKey {
        name: &'static str,
        trap: Arc<AtomicBool>,
    }

    impl PartialEq for TrapKey {
        fn eq(&self, other: &Self) -> bool {
            self.name == other.name
        }
    }

    impl Eq for TrapKey {}

    impl std::hash::Hash for TrapKey {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            if self.trap.swap(false, Ordering::SeqCst) {
                panic!("key hash failed");
            }
            self.name.hash(state);
        }
    }

    struct ArmOnStop {
        trap: Arc<AtomicBool>,
    }

    impl Receiver<u32> for ArmOnStop {
        fn receive(&self, _message: u32) -> Result<(), ReceiverError> {
            Ok(())
        }

        fn on_stop(&self) -> Result<(), ReceiverError> {
            self.trap.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_crashed_message_loop_restarts_and_keeps_delivering() {
        let dispatcher: Dispatcher<TrapKey, u32> = Dispatcher::new(
            &DispatcherConfig::default()
                .with_name("crash-dispatch")
                .with_worker_threads(1),
        )
        .unwrap();

        let trap = Arc::new(AtomicBool::new(false));
        let doomed = TrapKey {
            name: "doomed",
            trap: Arc::clone(&trap),
        };
        dispatcher
            .register(doomed.clone(), Arc::new(ArmOnStop { trap }), false)
            .unwrap();
        // Removing the stopped key after OnStop hashes it on the loop thread.
        assert!(dispatcher.unregister(&doomed));
        assert!(wait_until(DEFAULT_TIMEOUT, || dispatcher.loop_restarts() == 1));

        let seen = Recorder::new();
        let sink = seen.clone();
        let healthy = TrapKey {
            name: "healthy",
            trap: Arc::new(AtomicBool::new(false)),
        };
        dispatcher
            .register(
                healthy.clone(),
                Arc::new(receiver_fn(move |n: u32| {
                    sink.record(n);
                    Ok(())
                })),
                false,
            )
            .unwrap();
        for n in 0..5 {
            dispatcher.post_message(&healthy, n);
        }

        assert!(seen.wait_for(5, DEFAULT_TIMEOUT));
        assert_eq!(seen.snapshot(), vec![0, 1, 2, 3, 4]);
        assert_eq!(dispatcher.loop_restarts(), 1);

        dispatcher.close();
        assert!(dispatcher.await_termination(DEFAULT_TIMEOUT));
    }
}
