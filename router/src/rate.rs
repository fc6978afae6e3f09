//! Per-peer rate windows
//!
//! Remembers when something was last sent to (or accepted from) a peer under
//! a given key and answers whether a window has elapsed since.

use meshquery_core::PeerAddr;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Last-seen timestamps keyed by `(peer, key)`
#[derive(Debug, Default)]
pub struct RateLimiter {
    last: Mutex<HashMap<(PeerAddr, String), Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: &PeerAddr, key: &str) {
        self.record_at(peer, key, Instant::now());
    }

    /// Store `now` for `(peer, key)`; an older instant never replaces a newer one
    pub fn record_at(&self, peer: &PeerAddr, key: &str, now: Instant) {
        let mut last = self.last.lock();
        let entry = last
            .entry((peer.clone(), key.to_string()))
            .or_insert(now);
        if now > *entry {
            *entry = now;
        }
    }

    pub fn last(&self, peer: &PeerAddr, key: &str) -> Option<Instant> {
        self.last
            .lock()
            .get(&(peer.clone(), key.to_string()))
            .copied()
    }

    pub fn is_ready(&self, peer: &PeerAddr, key: &str, window: Duration) -> bool {
        self.is_ready_at(peer, key, window, Instant::now())
    }

    /// True when nothing was recorded or `window` has passed since
    pub fn is_ready_at(&self, peer: &PeerAddr, key: &str, window: Duration, now: Instant) -> bool {
        match self.last(peer, key) {
            Some(prev) => now.saturating_duration_since(prev) >= window,
            None => true,
        }
    }

    /// Check the window and record `now` in one step. The timestamp is
    /// stored even when the check fails.
    pub fn check_and_record(&self, peer: &PeerAddr, key: &str, window: Duration) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match last.entry((peer.clone(), key.to_string())) {
            Entry::Occupied(mut e) => {
                let ready = now.saturating_duration_since(*e.get()) >= window;
                if now > *e.get() {
                    e.insert(now);
                }
                ready
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    /// Forget everything recorded for `peer`
    pub fn forget(&self, peer: &PeerAddr) {
        self.last.lock().retain(|(p, _), _| p != peer);
    }
}
