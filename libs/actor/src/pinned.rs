//! Pinned dispatcher: one logical ordered loop per key over a shared pool.
//!
//! A key's mailbox occupies a pool thread only while it has messages, and
//! never more than one at a time. Receivers may block; they only hold up
//! other keys once every pool thread is blocked.

use std::sync::Arc;
use std::time::Duration;

use courier_executor::ExecutionContext;
use tracing::{debug, info};

use crate::config::DispatcherConfig;
use crate::dispatcher::MessageDispatcher;
use crate::error::DispatchError;
use crate::mailbox::{Mailbox, ProcessOutcome};
use crate::receiver::{DispatchKey, Message, Receiver};
use crate::registry::Registry;
use crate::stats::DispatchStats;

struct Shared<K, M> {
    registry: Registry<K, M>,
    context: ExecutionContext,
    throughput: Option<usize>,
}

/// Dispatcher giving every key its own ordered loop on a shared pool.
///
/// Concurrent receivers are rejected with
/// [`DispatchError::ConcurrentNotSupported`].
pub struct PinnedDispatcher<K, M> {
    shared: Arc<Shared<K, M>>,
}

impl<K: DispatchKey, M: Message> PinnedDispatcher<K, M> {
    pub fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        config.validate()?;
        let context = ExecutionContext::with_threads(&config.name, config.worker_threads)?;

        info!(
            dispatcher = %config.name,
            worker_threads = config.worker_threads,
            throughput = ?config.throughput,
            "Pinned dispatcher started"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                registry: Registry::new(&config.name),
                context,
                throughput: config.throughput,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry.is_closed()
    }
}

impl<K: DispatchKey, M: Message> MessageDispatcher<K, M> for PinnedDispatcher<K, M> {
    fn register(
        &self,
        key: K,
        receiver: Arc<dyn Receiver<M>>,
        enable_concurrent: bool,
    ) -> Result<(), DispatchError> {
        if enable_concurrent {
            return Err(DispatchError::ConcurrentNotSupported);
        }
        let mailbox = self.shared.registry.register(key, receiver, false)?;
        schedule_run(&self.shared, mailbox);
        Ok(())
    }

    fn unregister(&self, key: &K) -> bool {
        match self.shared.registry.unregister(key) {
            Some(mailbox) => {
                schedule_run(&self.shared, mailbox);
                true
            }
            None => false,
        }
    }

    fn post_message(&self, key: &K, message: M) {
        if let Some(mailbox) = self.shared.registry.post(key, message) {
            schedule_run(&self.shared, mailbox);
        }
    }

    fn close(&self) {
        let Some(closing) = self.shared.registry.close() else {
            return;
        };
        for mailbox in closing {
            schedule_run(&self.shared, mailbox);
        }
        self.shared.context.shutdown();
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.context.await_termination(timeout)
    }

    fn is_registered(&self, key: &K) -> bool {
        self.shared.registry.contains(key)
    }

    fn stats(&self) -> DispatchStats {
        self.shared.registry.stats()
    }
}

impl<K, M> std::fmt::Debug for PinnedDispatcher<K, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedDispatcher")
            .field("context", &self.shared.context)
            .field("throughput", &self.shared.throughput)
            .finish_non_exhaustive()
    }
}

/// Start a run for the mailbox unless one is already in flight.
fn schedule_run<K: DispatchKey, M: Message>(
    shared: &Arc<Shared<K, M>>,
    mailbox: Arc<Mailbox<K, M>>,
) {
    if !mailbox.try_schedule() {
        return;
    }
    let task_shared = Arc::clone(shared);
    let task_mailbox = Arc::clone(&mailbox);
    if shared
        .context
        .execute(move || run(task_shared, task_mailbox))
        .is_err()
    {
        debug!(key = ?mailbox.key(), "Pool closed; draining on caller thread");
        run(Arc::clone(shared), mailbox);
    }
}

/// One run of a key's loop: drain up to the throughput budget, then hand the
/// thread back and resubmit if messages remain.
fn run<K: DispatchKey, M: Message>(shared: Arc<Shared<K, M>>, mailbox: Arc<Mailbox<K, M>>) {
    loop {
        if mailbox.process(shared.throughput) == ProcessOutcome::Terminated {
            shared.registry.remove_terminated(&mailbox);
            return;
        }
        if !mailbox.finish_run() {
            return;
        }

        let task_shared = Arc::clone(&shared);
        let task_mailbox = Arc::clone(&mailbox);
        if shared
            .context
            .execute(move || run(task_shared, task_mailbox))
            .is_ok()
        {
            return;
        }
        // Pool closed: keep draining on this thread.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReceiverError;
    use crate::receiver::receiver_fn;
    use courier_testing::{wait_until, Recorder, DEFAULT_TIMEOUT};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_concurrent_registration_rejected() {
        let dispatcher: PinnedDispatcher<u32, u32> =
            PinnedDispatcher::new(&DispatcherConfig::default().with_worker_threads(1)).unwrap();
        let result = dispatcher.register(1, Arc::new(receiver_fn(|_: u32| Ok(()))), true);
        assert!(matches!(result, Err(DispatchError::ConcurrentNotSupported)));
        assert!(!dispatcher.is_registered(&1));
        dispatcher.close();
    }

    struct Gated {
        entered: Arc<AtomicBool>,
        release: Arc<AtomicBool>,
        seen: Recorder<u32>,
        stops: Recorder<()>,
    }

    impl Receiver<u32> for Gated {
        fn receive(&self, message: u32) -> Result<(), ReceiverError> {
            if message == 0 {
                self.entered.store(true, Ordering::SeqCst);
                wait_until(DEFAULT_TIMEOUT, || self.release.load(Ordering::SeqCst));
            }
            self.seen.record(message);
            Ok(())
        }

        fn on_stop(&self) -> Result<(), ReceiverError> {
            self.stops.record(());
            Ok(())
        }
    }

    #[test]
    fn test_run_drains_inline_after_pool_shutdown() {
        let dispatcher: PinnedDispatcher<u32, u32> = PinnedDispatcher::new(
            &DispatcherConfig::default()
                .with_name("pinned-inline")
                .with_worker_threads(1)
                .with_throughput(Some(2)),
        )
        .unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let seen = Recorder::new();
        let stops = Recorder::new();
        dispatcher
            .register(
                7,
                Arc::new(Gated {
                    entered: Arc::clone(&entered),
                    release: Arc::clone(&release),
                    seen: seen.clone(),
                    stops: stops.clone(),
                }),
                false,
            )
            .unwrap();
        for n in 0..10 {
            dispatcher.post_message(&7, n);
        }
        assert!(wait_until(DEFAULT_TIMEOUT, || entered.load(Ordering::SeqCst)));

        // The pool stops accepting work while the run is parked mid-budget,
        // so every later resubmission fails and the run continues in place.
        dispatcher.close();
        release.store(true, Ordering::SeqCst);

        assert!(dispatcher.await_termination(DEFAULT_TIMEOUT));
        assert_eq!(seen.snapshot(), (0..10).collect::<Vec<_>>());
        assert_eq!(stops.len(), 1);
        assert!(!dispatcher.is_registered(&7));
    }
}
