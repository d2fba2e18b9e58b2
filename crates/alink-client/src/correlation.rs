//! Pending-request correlation table.
//!
//! Every correlated call registers a single-slot waiter keyed by its request
//! id, publishes, and then waits with a bounded timeout. The dispatch path
//! resolves the waiter when the reply arrives. Resolution never blocks: if
//! the caller already gave up, the reply is dropped.
//!
//! Entries carry a deadline of `timeout + grace`. A waiter whose caller was
//! cancelled mid-wait is never removed by `wait`, so [`CorrelationTable::sweep`]
//! evicts it once the deadline passes and logs the eviction.

use crate::error::{ClientResult, Error};
use alink_proto::{Reply, RequestId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default grace added to a call's timeout before its entry may be evicted.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct PendingCall {
    reply_tx: oneshot::Sender<Reply>,
    deadline: Option<Instant>,
}

impl PendingCall {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Handle a caller waits on.
#[derive(Debug)]
pub struct Waiter {
    id: RequestId,
    reply_rx: oneshot::Receiver<Reply>,
}

impl Waiter {
    /// Request id this waiter is keyed by.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// Table of outstanding requests.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: DashMap<RequestId, PendingCall>,
    grace: Duration,
}

impl CorrelationTable {
    /// Create a table with the given eviction grace.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            grace,
        }
    }

    /// Register a waiter for `id`, expiring `timeout + grace` from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequestId`] if a waiter for `id` already
    /// exists; the existing waiter is left untouched.
    pub fn register(&self, id: RequestId, timeout: Duration) -> ClientResult<Waiter> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => {
                tracing::error!(%id, "Request id collision, refusing to overwrite pending call");
                Err(Error::DuplicateRequestId(id))
            }
            Entry::Vacant(slot) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                slot.insert(PendingCall {
                    reply_tx,
                    deadline: self.deadline(timeout),
                });
                Ok(Waiter { id, reply_rx })
            }
        }
    }

    /// `None` when the deadline lies beyond what `Instant` can represent;
    /// such entries are never evicted.
    fn deadline(&self, timeout: Duration) -> Option<Instant> {
        Instant::now()
            .checked_add(timeout)
            .and_then(|at| at.checked_add(self.grace))
    }

    /// Deliver a reply to its waiter. Returns whether a waiter was registered.
    pub fn resolve(&self, reply: Reply) -> bool {
        let id = reply.id;
        let Some((_, pending)) = self.pending.remove(&id) else {
            tracing::debug!(%id, code = reply.code, "Reply without pending request dropped");
            return false;
        };
        if pending.reply_tx.send(reply).is_err() {
            tracing::debug!(%id, "Waiter gone before reply arrived");
        }
        true
    }

    /// Drop the entry for `id` without delivering anything.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Wait for the reply to `waiter`, at most `timeout`.
    ///
    /// The entry is removed on return, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when nothing arrives in time and
    /// [`Error::Remote`] when the reply carries a failure code.
    pub async fn wait(&self, waiter: Waiter, timeout: Duration) -> ClientResult<Value> {
        let Waiter { id, reply_rx } = waiter;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) if reply.is_success() => Ok(reply.data),
            Ok(Ok(reply)) => Err(Error::Remote {
                code: reply.code,
                message: reply.message.unwrap_or_default(),
            }),
            // Sender dropped: the entry was evicted or cancelled.
            Ok(Err(_)) => Err(Error::Timeout(id)),
            Err(_) => {
                self.pending.remove(&id);
                tracing::debug!(%id, ?timeout, "Request timed out");
                Err(Error::Timeout(id))
            }
        }
    }

    /// Evict entries past their deadline. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.expired(now))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            if self
                .pending
                .remove_if(&id, |_, pending| pending.expired(now))
                .is_some()
            {
                tracing::warn!(%id, "Evicting unanswered request; upstream may have stopped replying");
                evicted += 1;
            }
        }
        evicted
    }

    /// Whether a waiter for `id` is registered.
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}
