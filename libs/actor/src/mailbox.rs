//! Per-key mailbox: a FIFO of pending messages plus drain exclusivity.
//!
//! A mailbox moves between three states:
//!
//! - `Idle`: nobody is draining
//! - `Draining`: one drainer (or several, for concurrent receivers) is
//!   delivering messages
//! - `Stopped`: `close` was called; new posts are dropped and `OnStop` sits
//!   behind everything queued before it
//!
//! A thread that wins the drain right keeps delivering until the queue is
//! empty or its budget runs out. The empty check and the release of the drain
//! right happen under the same lock, so a concurrent `post` is either picked
//! up by the current drainer or finds the mailbox idle.
//!
//! `OnStart` and `OnStop` are barriers even for concurrent receivers: one is
//! only taken once no other drainer is active, and nothing else is taken
//! while it is being delivered. The last drainer to leave always looks at the
//! queue, so a barrier left at the front is never stranded.

use std::collections::VecDeque;
use std::sync::Arc;

use courier_executor::run_catching;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::ReceiverError;
use crate::receiver::{DispatchKey, Message, Receiver};
use crate::stats::Counters;

/// Entry in a mailbox queue.
#[derive(Debug)]
pub enum InboxMessage<M> {
    User(M),
    OnStart,
    OnStop,
}

/// Result of one [`Mailbox::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another thread holds the drain right, or must finish before the next
    /// lifecycle signal can be delivered.
    Busy,
    /// The queue was empty when the call returned.
    Idle,
    /// The budget ran out with messages still queued.
    Yielded,
    /// `OnStop` has been delivered.
    Terminated,
}

struct MailboxState<M> {
    queue: VecDeque<InboxMessage<M>>,
    active: usize,
    /// A lifecycle signal is being delivered.
    barrier: bool,
    stopped: bool,
    terminated: bool,
    scheduled: bool,
}

/// Queue and drain state for one registered receiver.
pub struct Mailbox<K, M> {
    key: K,
    receiver: Arc<dyn Receiver<M>>,
    enable_concurrent: bool,
    state: Mutex<MailboxState<M>>,
    counters: Arc<Counters>,
}

impl<M> InboxMessage<M> {
    fn is_lifecycle(&self) -> bool {
        !matches!(self, InboxMessage::User(_))
    }
}

impl<M> MailboxState<M> {
    /// Pop the front message, raising the barrier for lifecycle signals.
    fn take_next(&mut self) -> Option<InboxMessage<M>> {
        let next = self.queue.pop_front()?;
        if next.is_lifecycle() {
            self.barrier = true;
        }
        Some(next)
    }
}

impl<K: DispatchKey, M: Message> Mailbox<K, M> {
    /// Create a mailbox with `OnStart` already queued.
    pub(crate) fn new(
        key: K,
        receiver: Arc<dyn Receiver<M>>,
        enable_concurrent: bool,
        counters: Arc<Counters>,
    ) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(InboxMessage::OnStart);
        Self {
            key,
            receiver,
            enable_concurrent,
            state: Mutex::new(MailboxState {
                queue,
                active: 0,
                barrier: false,
                stopped: false,
                terminated: false,
                scheduled: false,
            }),
            counters,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn is_concurrent(&self) -> bool {
        self.enable_concurrent
    }

    /// Append a user message. Returns false (and drops it) once stopped.
    pub fn post(&self, message: M) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            drop(state);
            warn!(key = ?self.key, "Dropped message posted to stopped mailbox");
            return false;
        }
        state.queue.push_back(InboxMessage::User(message));
        true
    }

    /// Stop the mailbox and queue `OnStop`. Only the first call does anything.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.stopped {
            return false;
        }
        state.stopped = true;
        state.queue.push_back(InboxMessage::OnStop);
        true
    }

    /// Deliver queued messages on the calling thread.
    ///
    /// `budget` caps how many messages this call delivers; `None` drains until
    /// the queue is empty.
    pub fn process(&self, budget: Option<usize>) -> ProcessOutcome {
        let mut next = {
            let mut state = self.state.lock();
            if state.terminated {
                return ProcessOutcome::Terminated;
            }
            if state.barrier || (!self.enable_concurrent && state.active > 0) {
                return ProcessOutcome::Busy;
            }
            if state.queue.front().is_some_and(|front| front.is_lifecycle()) && state.active > 0 {
                return ProcessOutcome::Busy;
            }
            match state.take_next() {
                Some(message) => {
                    state.active += 1;
                    message
                }
                None => return ProcessOutcome::Idle,
            }
        };

        let mut guard = ActiveGuard {
            mailbox: self,
            armed: true,
        };
        let mut handled = 0usize;
        loop {
            let stop = matches!(next, InboxMessage::OnStop);
            self.deliver(next);
            handled += 1;

            let mut state = self.state.lock();
            state.barrier = false;
            if stop {
                state.terminated = true;
                state.active -= 1;
                guard.armed = false;
                debug!(key = ?self.key, "Mailbox terminated");
                return ProcessOutcome::Terminated;
            }
            if budget.is_some_and(|budget| handled >= budget) {
                state.active -= 1;
                guard.armed = false;
                return if state.queue.is_empty() {
                    ProcessOutcome::Idle
                } else {
                    ProcessOutcome::Yielded
                };
            }
            if state.queue.front().is_some_and(|front| front.is_lifecycle()) && state.active > 1 {
                // Whoever leaves last delivers it.
                state.active -= 1;
                guard.armed = false;
                return ProcessOutcome::Busy;
            }
            match state.take_next() {
                Some(message) => next = message,
                None => {
                    state.active -= 1;
                    guard.armed = false;
                    return ProcessOutcome::Idle;
                }
            }
        }
    }

    fn deliver(&self, message: InboxMessage<M>) {
        let (hook, outcome) = match message {
            InboxMessage::User(message) => {
                self.counters.delivered();
                ("receive", run_catching(|| self.receiver.receive(message)))
            }
            InboxMessage::OnStart => ("on_start", run_catching(|| self.receiver.on_start())),
            InboxMessage::OnStop => ("on_stop", run_catching(|| self.receiver.on_stop())),
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.failed();
                log_failure(&self.key, hook, &e);
            }
            Err(e) => {
                self.counters.failed();
                error!(key = ?self.key, hook, error = %e, "Receiver panicked");
            }
        }
    }

    /// Claim the right to schedule a run. Used by strategies that give each
    /// mailbox at most one run in flight.
    pub(crate) fn try_schedule(&self) -> bool {
        let mut state = self.state.lock();
        if state.scheduled || state.terminated || state.queue.is_empty() {
            return false;
        }
        state.scheduled = true;
        true
    }

    /// Release the run claimed by [`try_schedule`](Self::try_schedule).
    ///
    /// Returns true if messages arrived meanwhile; the claim is then kept and
    /// the caller must schedule another run.
    pub(crate) fn finish_run(&self) -> bool {
        let mut state = self.state.lock();
        if !state.terminated && !state.queue.is_empty() {
            return true;
        }
        state.scheduled = false;
        false
    }

    /// Messages waiting to be delivered, control signals included.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threads currently draining.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }
}

fn log_failure<K: DispatchKey>(key: &K, hook: &str, e: &ReceiverError) {
    error!(key = ?key, hook, error = %e, "Receiver failed");
}

/// Releases the drain right if delivery unwinds.
struct ActiveGuard<'a, K, M> {
    mailbox: &'a Mailbox<K, M>,
    armed: bool,
}

impl<K, M> Drop for ActiveGuard<'_, K, M> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.mailbox.state.lock();
            state.active -= 1;
            state.barrier = false;
        }
    }
}

impl<K: std::fmt::Debug, M> std::fmt::Debug for Mailbox<K, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mailbox")
            .field("key", &self.key)
            .field("concurrent", &self.enable_concurrent)
            .field("queued", &state.queue.len())
            .field("active", &state.active)
            .field("stopped", &state.stopped)
            .field("terminated", &state.terminated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::receiver_fn;
    use courier_testing::Recorder;

    struct Lifecycle {
        events: Recorder<String>,
    }

    impl Receiver<u32> for Lifecycle {
        fn receive(&self, message: u32) -> Result<(), ReceiverError> {
            self.events.record(format!("msg:{message}"));
            Ok(())
        }

        fn on_start(&self) -> Result<(), ReceiverError> {
            self.events.record("start".to_string());
            Ok(())
        }

        fn on_stop(&self) -> Result<(), ReceiverError> {
            self.events.record("stop".to_string());
            Ok(())
        }
    }

    fn lifecycle_mailbox(concurrent: bool) -> (Mailbox<&'static str, u32>, Recorder<String>) {
        let events = Recorder::new();
        let receiver = Arc::new(Lifecycle {
            events: events.clone(),
        });
        let mailbox = Mailbox::new("k", receiver, concurrent, Arc::new(Counters::default()));
        (mailbox, events)
    }

    #[test]
    fn test_start_messages_stop_in_order() {
        let (mailbox, events) = lifecycle_mailbox(false);
        assert!(mailbox.post(1));
        assert!(mailbox.post(2));
        assert!(mailbox.close());

        assert_eq!(mailbox.process(None), ProcessOutcome::Terminated);
        assert_eq!(events.snapshot(), vec!["start", "msg:1", "msg:2", "stop"]);
        assert!(mailbox.is_terminated());
        assert_eq!(mailbox.active(), 0);
    }

    #[test]
    fn test_post_after_close_is_dropped() {
        let (mailbox, events) = lifecycle_mailbox(false);
        mailbox.close();
        assert!(!mailbox.post(7));
        mailbox.process(None);
        assert_eq!(events.snapshot(), vec!["start", "stop"]);
    }

    #[test]
    fn test_close_twice_queues_one_stop() {
        let (mailbox, events) = lifecycle_mailbox(false);
        assert!(mailbox.close());
        assert!(!mailbox.close());
        assert_eq!(mailbox.process(None), ProcessOutcome::Terminated);
        assert_eq!(mailbox.process(None), ProcessOutcome::Terminated);
        assert_eq!(events.snapshot(), vec!["start", "stop"]);
    }

    #[test]
    fn test_budget_yields() {
        let (mailbox, events) = lifecycle_mailbox(false);
        for i in 0..4 {
            mailbox.post(i);
        }
        // OnStart plus 4 messages.
        assert_eq!(mailbox.process(Some(2)), ProcessOutcome::Yielded);
        assert_eq!(mailbox.process(Some(2)), ProcessOutcome::Yielded);
        assert_eq!(mailbox.process(Some(2)), ProcessOutcome::Idle);
        assert_eq!(mailbox.process(Some(2)), ProcessOutcome::Idle);
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_exclusive_mailbox_reports_busy() {
        let (mailbox, _) = lifecycle_mailbox(false);
        mailbox.state.lock().active = 1;
        assert_eq!(mailbox.process(None), ProcessOutcome::Busy);
    }

    #[test]
    fn test_concurrent_mailbox_shares_user_messages() {
        let (mailbox, events) = lifecycle_mailbox(true);
        assert_eq!(mailbox.process(None), ProcessOutcome::Idle);

        mailbox.state.lock().active = 1;
        mailbox.post(1);
        assert_eq!(mailbox.process(None), ProcessOutcome::Idle);
        assert_eq!(mailbox.active(), 1);
        assert_eq!(events.snapshot(), vec!["start", "msg:1"]);
    }

    #[test]
    fn test_lifecycle_signal_waits_for_other_drainers() {
        let (mailbox, events) = lifecycle_mailbox(true);
        // Another drainer is still inside a receive call.
        mailbox.state.lock().active = 1;
        assert_eq!(mailbox.process(None), ProcessOutcome::Busy);
        assert!(events.is_empty());

        mailbox.state.lock().active = 0;
        assert_eq!(mailbox.process(None), ProcessOutcome::Idle);
        mailbox.post(1);
        mailbox.close();

        mailbox.state.lock().active = 1;
        // The message is shared, OnStop is left for the last drainer out.
        assert_eq!(mailbox.process(None), ProcessOutcome::Busy);
        assert_eq!(events.snapshot(), vec!["start", "msg:1"]);
        assert_eq!(mailbox.len(), 1);

        mailbox.state.lock().active = 0;
        assert_eq!(mailbox.process(None), ProcessOutcome::Terminated);
        assert_eq!(events.snapshot(), vec!["start", "msg:1", "stop"]);
    }

    #[test]
    fn test_nothing_overtakes_lifecycle_signal() {
        let (mailbox, _) = lifecycle_mailbox(true);
        mailbox.post(1);
        mailbox.state.lock().barrier = true;
        assert_eq!(mailbox.process(None), ProcessOutcome::Busy);
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_failures_do_not_stop_drain() {
        let counters = Arc::new(Counters::default());
        let seen = Recorder::new();
        let sink = seen.clone();
        let receiver = Arc::new(receiver_fn(move |message: u32| {
            sink.record(message);
            match message {
                1 => Err(ReceiverError::failed("bad message")),
                2 => panic!("receiver bug"),
                _ => Ok(()),
            }
        }));
        let mailbox = Mailbox::new(0u8, receiver, false, Arc::clone(&counters));
        for i in 0..4 {
            mailbox.post(i);
        }

        assert_eq!(mailbox.process(None), ProcessOutcome::Idle);
        assert_eq!(seen.snapshot(), vec![0, 1, 2, 3]);
        let stats = counters.snapshot();
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.failed, 2);
        assert_eq!(mailbox.active(), 0);
    }

    #[test]
    fn test_schedule_claim() {
        let (mailbox, _) = lifecycle_mailbox(false);
        assert!(mailbox.try_schedule());
        assert!(!mailbox.try_schedule());

        mailbox.process(None);
        assert!(!mailbox.finish_run());

        mailbox.post(1);
        assert!(mailbox.try_schedule());
        // Message still queued: the claim is kept.
        assert!(mailbox.finish_run());
        assert!(!mailbox.try_schedule());
    }
}
