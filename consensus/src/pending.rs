//! Pending request table
//!
//! Every request id owns its own reply set, lock and notifier, so waiting on
//! one request never blocks another. Replies for ids we never registered, or
//! that already returned, are stored all the same.

use dashmap::DashMap;
use meshquery_core::{PeerAddr, RequestId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use crate::reply::{Reply, ReplySet};

/// Replies gathered for one request id
pub struct PendingRequest {
    replies: Mutex<ReplySet>,
    notify: Notify,
    created: Instant,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            replies: Mutex::new(ReplySet::new()),
            notify: Notify::new(),
            created: Instant::now(),
        }
    }

    /// Record a reply and wake waiters. Returns the number of distinct peers.
    pub fn record(&self, peer: PeerAddr, reply: Reply) -> usize {
        let count = {
            let mut replies = self.replies.lock();
            replies.insert(peer, reply);
            replies.len()
        };
        self.notify.notify_waiters();
        count
    }

    pub fn snapshot(&self) -> ReplySet {
        self.replies.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until `needed` distinct peers replied or `deadline` passes, then
    /// return what has been collected
    pub async fn wait_for(&self, needed: usize, deadline: tokio::time::Instant) -> ReplySet {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a reply landing in between still wakes us.
            notified.as_mut().enable();

            {
                let replies = self.replies.lock();
                if replies.len() >= needed {
                    return replies.clone();
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.snapshot();
            }
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// All pending requests, keyed by request id
pub struct PendingTable {
    requests: DashMap<RequestId, Arc<PendingRequest>>,
    retention: Duration,
}

impl PendingTable {
    pub fn new(retention: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            retention,
        }
    }

    /// Create the entry for a new request, dropping expired ones first
    pub fn register(&self, id: &RequestId) -> Arc<PendingRequest> {
        self.prune();
        self.entry(id)
    }

    fn entry(&self, id: &RequestId) -> Arc<PendingRequest> {
        self.requests
            .entry(id.clone())
            .or_insert_with(|| Arc::new(PendingRequest::new()))
            .clone()
    }

    /// Store a reply for `id`, known or not
    pub fn record(&self, id: &RequestId, peer: PeerAddr, reply: Reply) -> usize {
        let pending = self.entry(id);
        let count = pending.record(peer, reply);
        debug!("Request {} now has {} replies", id, count);
        count
    }

    pub fn get(&self, id: &RequestId) -> Option<Arc<PendingRequest>> {
        self.requests.get(id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self, id: &RequestId) -> Option<ReplySet> {
        self.get(id).map(|pending| pending.snapshot())
    }

    /// Drop entries older than the retention window
    pub fn prune(&self) -> usize {
        let before = self.requests.len();
        let retention = self.retention;
        self.requests.retain(|_, pending| pending.age() < retention);
        let removed = before.saturating_sub(self.requests.len());
        if removed > 0 {
            debug!("Pruned {} expired reply sets", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
