//! Key to mailbox registry shared by both dispatch strategies.
//!
//! Register, unregister and close serialize on the lifecycle lock. Posting
//! only takes the map's read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::DispatchError;
use crate::mailbox::Mailbox;
use crate::receiver::{DispatchKey, Message, Receiver};
use crate::stats::{Counters, DispatchStats};

pub(crate) struct Registry<K, M> {
    name: String,
    entries: RwLock<HashMap<K, Arc<Mailbox<K, M>>>>,
    /// Set once `close` starts.
    lifecycle: Mutex<bool>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl<K: DispatchKey, M: Message> Registry<K, M> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(false),
            closed: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create and store a mailbox for `key`, with `OnStart` queued.
    pub(crate) fn register(
        &self,
        key: K,
        receiver: Arc<dyn Receiver<M>>,
        enable_concurrent: bool,
    ) -> Result<Arc<Mailbox<K, M>>, DispatchError> {
        let stopped = self.lifecycle.lock();
        if *stopped {
            return Err(DispatchError::DispatcherClosed);
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(DispatchError::DuplicateRegistration(format!("{key:?}")));
        }
        let mailbox = Arc::new(Mailbox::new(
            key.clone(),
            receiver,
            enable_concurrent,
            Arc::clone(&self.counters),
        ));
        entries.insert(key.clone(), Arc::clone(&mailbox));
        drop(entries);

        info!(dispatcher = %self.name, key = ?key, concurrent = enable_concurrent, "Registered receiver");
        Ok(mailbox)
    }

    /// Stop the key's mailbox. Returns it if this call stopped it.
    pub(crate) fn unregister(&self, key: &K) -> Option<Arc<Mailbox<K, M>>> {
        let _lifecycle = self.lifecycle.lock();
        let mailbox = self.entries.read().get(key).cloned();
        match mailbox {
            Some(mailbox) if mailbox.close() => {
                debug!(dispatcher = %self.name, key = ?key, "Unregistering receiver");
                Some(mailbox)
            }
            _ => None,
        }
    }

    /// Append a message to the key's mailbox. Returns the mailbox if the
    /// message was accepted.
    pub(crate) fn post(&self, key: &K, message: M) -> Option<Arc<Mailbox<K, M>>> {
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped();
            debug!(dispatcher = %self.name, key = ?key, "Dropped message: dispatcher closed");
            return None;
        }
        let Some(mailbox) = self.entries.read().get(key).cloned() else {
            self.counters.dropped();
            debug!(dispatcher = %self.name, key = ?key, "Dropped message: unknown key");
            return None;
        };
        if mailbox.post(message) {
            self.counters.posted();
            Some(mailbox)
        } else {
            self.counters.dropped();
            None
        }
    }

    /// Reject further registrations and stop every mailbox.
    ///
    /// Returns the mailboxes this call stopped, or `None` if the registry was
    /// already closed.
    pub(crate) fn close(&self) -> Option<Vec<Arc<Mailbox<K, M>>>> {
        let mut stopped = self.lifecycle.lock();
        if *stopped {
            return None;
        }
        *stopped = true;
        self.closed.store(true, Ordering::Release);

        let mailboxes: Vec<_> = self.entries.read().values().cloned().collect();
        let closing: Vec<_> = mailboxes.into_iter().filter(|m| m.close()).collect();
        info!(dispatcher = %self.name, receivers = closing.len(), "Closing dispatcher");
        Some(closing)
    }

    /// Drop a terminated mailbox, unless the key was already re-registered.
    pub(crate) fn remove_terminated(&self, mailbox: &Arc<Mailbox<K, M>>) {
        let mut entries = self.entries.write();
        let current = entries
            .get(mailbox.key())
            .is_some_and(|entry| Arc::ptr_eq(entry, mailbox));
        if current {
            entries.remove(mailbox.key());
            debug!(dispatcher = %self.name, key = ?mailbox.key(), "Receiver removed");
        }
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}
