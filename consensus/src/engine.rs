//! Consensus resolution over collected replies

use meshquery_core::{PeerAddr, RequestId, RouterError, RouterResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::pending::{PendingRequest, PendingTable};
use crate::reply::{Reply, ReplySet};

/// Fewest replies that must arrive before consensus is attempted: a bare
/// majority of `needed`, so a single-provider query needs its one reply
pub fn timeout_threshold(needed: usize) -> usize {
    needed / 2 + 1
}

/// Outcome of a successful consensus round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consensus {
    pub answer: Reply,
    /// Peers whose reply matched the answer
    pub agreeing: Vec<PeerAddr>,
    /// Peers that replied something else
    pub dissenting: Vec<PeerAddr>,
}

/// Pick the strict-majority reply.
///
/// Fails with `ServerTimeout` when fewer than [`timeout_threshold`] replies
/// arrived, and with `InternalServerError` when no payload is shared by more
/// than half of the collected replies. Candidates are tried in arrival order.
pub fn resolve(replies: &ReplySet, needed: usize) -> RouterResult<Consensus> {
    let received = replies.len();
    if received == 0 || received < timeout_threshold(needed) {
        return Err(RouterError::ServerTimeout { received, needed });
    }

    let mut seen: Vec<&str> = Vec::new();
    for (_, candidate) in replies.iter() {
        let raw = candidate.raw();
        if seen.contains(&raw) {
            continue;
        }
        seen.push(raw);

        let count = replies.iter().filter(|(_, r)| r.raw() == raw).count();
        if count * 2 > received {
            let (agreeing, dissenting) = replies
                .iter()
                .map(|(peer, r)| (peer.clone(), r.raw() == raw))
                .fold((Vec::new(), Vec::new()), |(mut yes, mut no), (peer, agrees)| {
                    if agrees {
                        yes.push(peer);
                    } else {
                        no.push(peer);
                    }
                    (yes, no)
                });
            return Ok(Consensus {
                answer: candidate.clone(),
                agreeing,
                dissenting,
            });
        }
    }

    Err(RouterError::InternalServerError(
        "No consensus between responses".to_string(),
    ))
}

/// Waits on pending requests and resolves them
pub struct ConsensusEngine {
    pending: Arc<PendingTable>,
}

impl ConsensusEngine {
    pub fn new(retention: Duration) -> Self {
        Self {
            pending: Arc::new(PendingTable::new(retention)),
        }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Register a request before any packet for it is sent
    pub fn register(&self, id: &RequestId) -> Arc<PendingRequest> {
        self.pending.register(id)
    }

    /// Block until `needed` replies arrived or `timeout` elapsed, then resolve
    pub async fn await_consensus(
        &self,
        id: &RequestId,
        needed: usize,
        timeout: Duration,
    ) -> RouterResult<Consensus> {
        let pending = match self.pending.get(id) {
            Some(pending) => pending,
            None => self.pending.register(id),
        };
        let deadline = tokio::time::Instant::now() + timeout;
        let replies = pending.wait_for(needed, deadline).await;

        match resolve(&replies, needed) {
            Ok(consensus) => {
                info!(
                    "Request {} resolved by {} of {} replies",
                    id,
                    consensus.agreeing.len(),
                    replies.len()
                );
                Ok(consensus)
            }
            Err(e) => {
                warn!("Request {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    /// Store a reply arriving from the network
    pub fn record_reply(&self, id: &RequestId, peer: PeerAddr, reply: Reply) -> usize {
        debug!("Reply to {} from {}", id, peer);
        self.pending.record(id, peer, reply)
    }

    pub fn replies(&self, id: &RequestId) -> Option<ReplySet> {
        self.pending.snapshot(id)
    }
}
