//! Request/reply correlation
//!
//! Sends one query packet per selected provider under a shared request id,
//! then waits on that id until enough providers answered or the wait window
//! closed. Replies are filed by the inbound side as they arrive.

use meshquery_consensus::{Consensus, ConsensusEngine, PendingRequest, Reply, ReplySet};
use meshquery_core::{
    Command, PeerAddr, ProviderRegistry, RequestId, RouterResult, StakeProof, Transport,
    CHANNEL_TAG,
};
use meshquery_p2p::{Message, Query, ReplyMessage};
use meshquery_payment::{PaymentEngine, PaymentToken};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::rate::RateLimiter;

/// What to send, independent of the receiving provider
#[derive(Debug, Clone)]
pub struct OutboundQuery {
    pub command: Command,
    /// Chain identifier, or the plugin name for custom calls
    pub chain: String,
    pub params: Vec<String>,
    /// Key the send is rate limited under
    pub rate_key: String,
}

pub struct Correlator {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ProviderRegistry>,
    payments: Arc<PaymentEngine>,
    rates: Arc<RateLimiter>,
    consensus: ConsensusEngine,
}

impl Correlator {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ProviderRegistry>,
        payments: Arc<PaymentEngine>,
        rates: Arc<RateLimiter>,
        retention: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            payments,
            rates,
            consensus: ConsensusEngine::new(retention),
        }
    }

    /// Open the reply set for a fresh request id
    pub fn register(&self) -> (RequestId, Arc<PendingRequest>) {
        let id = RequestId::generate();
        let pending = self.consensus.register(&id);
        (id, pending)
    }

    /// Send `query` to every target with its payment token, signed by the
    /// stake key. Returns the number of packets handed to the transport.
    ///
    /// A token whose packet could not be sent is released back to the wallet.
    pub async fn dispatch(
        &self,
        id: &RequestId,
        query: &OutboundQuery,
        stake: &StakeProof,
        targets: Vec<(PeerAddr, PaymentToken)>,
    ) -> usize {
        let mut sent = 0;
        for (peer, token) in targets {
            let message = Message::Query(Query {
                command: query.command,
                stake: stake.stake,
                request_id: id.clone(),
                chain: query.chain.clone(),
                payment: token.to_wire(),
                params: query.params.clone(),
            });
            let bytes = match message.encode(Some(stake.signer.as_ref())) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Cannot encode {} for {}: {}", query.command, peer, e);
                    self.payments.release(&token);
                    continue;
                }
            };

            match self.transport.send(&peer, CHANNEL_TAG, bytes).await {
                Ok(()) => {
                    self.rates.record(&peer, &query.rate_key);
                    sent += 1;
                    debug!("Sent {} {} to {}", query.command, id, peer);
                }
                Err(e) => {
                    warn!("Failed to send {} to {}: {}", id, peer, e);
                    self.payments.release(&token);
                }
            }
        }
        info!("Dispatched {} to {} providers", id, sent);
        sent
    }

    /// Wait for `needed` replies to `id` and resolve them
    pub async fn await_consensus(
        &self,
        id: &RequestId,
        needed: usize,
        timeout: Duration,
    ) -> RouterResult<Consensus> {
        self.consensus.await_consensus(id, needed, timeout).await
    }

    /// File a reply from `from`. A provider reporting our payment channel as
    /// expired gets that channel dropped first.
    pub fn handle_reply(&self, from: &PeerAddr, message: ReplyMessage) -> usize {
        let reply = Reply::decode(&message.payload);
        if reply.is_expired_channel() {
            let dest = self
                .registry
                .find(from)
                .map(|info| info.payment_address)
                .unwrap_or_default();
            if !dest.is_empty() {
                if let Err(e) = self.payments.revalidate_on_expiry(&dest) {
                    error!("Failed to drop expired channel to {}: {}", dest, e);
                }
            }
        }
        self.consensus.record_reply(&message.request_id, from.clone(), reply)
    }

    pub fn replies(&self, id: &RequestId) -> Option<ReplySet> {
        self.consensus.replies(id)
    }
}
