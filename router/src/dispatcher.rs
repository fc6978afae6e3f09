//! Inbound packet dispatch
//!
//! Every packet arriving under the router tag is decoded once and routed by
//! command: config requests are answered here, config replies go to the
//! synchronizer, query replies to the correlator and everything else to the
//! provider handler, if this node runs one.

use meshquery_core::{Command, PeerAddr, ProviderConfig, RequestId, Transport, CHANNEL_TAG};
use meshquery_p2p::{
    ConfigReply, ConfigRequest, ConfigTarget, InboundPacket, Message, ReplyMessage, SELF_TARGET,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::ConfigCache;
use crate::correlator::Correlator;
use crate::handler::ProviderHandler;
use crate::rate::RateLimiter;
use crate::sync::ConfigSync;

/// Misbehaviour score reported for a packet we could not accept
pub const PROTOCOL_PENALTY: u32 = 10;

/// Config served to peers asking for ours
pub type SharedLocalConfig = Arc<RwLock<Option<Arc<ProviderConfig>>>>;

/// What happened to an inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Answered a config request
    ConfigServed(RequestId),
    /// Config request arrived inside the peer's interval; penalized
    ConfigRateLimited,
    /// Requested config is not known here
    ConfigUnavailable,
    /// Stored a provider config
    ConfigStored(PeerAddr),
    /// Filed a query reply; `replies` distinct peers have answered so far
    ReplyStored { request_id: RequestId, replies: usize },
    /// Passed a query to the provider handler
    Forwarded { replied: bool },
    /// Query arrived but this node serves none
    NoHandler,
    /// Not for the router, or the router is off
    Ignored,
    /// Undecodable or invalid; the sender was penalized
    Rejected(String),
}

pub struct InboundDispatcher {
    enabled: bool,
    transport: Arc<dyn Transport>,
    cache: Arc<ConfigCache>,
    sync: Arc<ConfigSync>,
    correlator: Arc<Correlator>,
    local: SharedLocalConfig,
    handler: Option<Arc<dyn ProviderHandler>>,
    config_requests: RateLimiter,
    config_interval: Duration,
}

impl InboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        transport: Arc<dyn Transport>,
        cache: Arc<ConfigCache>,
        sync: Arc<ConfigSync>,
        correlator: Arc<Correlator>,
        local: SharedLocalConfig,
        handler: Option<Arc<dyn ProviderHandler>>,
        config_interval: Duration,
    ) -> Self {
        Self {
            enabled,
            transport,
            cache,
            sync,
            correlator,
            local,
            handler,
            config_requests: RateLimiter::new(),
            config_interval,
        }
    }

    fn local_config(&self) -> Option<Arc<ProviderConfig>> {
        self.local.read().clone()
    }

    fn reject(&self, from: &PeerAddr, reason: String) -> DispatchOutcome {
        warn!("Rejected packet from {}: {}", from, reason);
        self.transport.penalize(from, PROTOCOL_PENALTY, &reason);
        DispatchOutcome::Rejected(reason)
    }

    pub async fn dispatch(&self, packet: InboundPacket) -> DispatchOutcome {
        if !self.enabled || packet.tag != CHANNEL_TAG {
            return DispatchOutcome::Ignored;
        }
        let from = packet.from;
        let message = match Message::decode(&packet.bytes) {
            Ok((message, _)) => message,
            Err(e) => return self.reject(&from, e.to_string()),
        };
        debug!("{} from {}", message.message_type(), from);

        match message {
            Message::ConfigRequest(request) => self.serve_config(&from, request).await,
            Message::ConfigReply(reply) => match self.sync.handle_config_reply(&from, reply) {
                Ok(provider) => DispatchOutcome::ConfigStored(provider),
                Err(e) => self.reject(&from, format!("bad config reply: {}", e)),
            },
            Message::Reply(reply) => {
                let request_id = reply.request_id.clone();
                let replies = self.correlator.handle_reply(&from, reply);
                DispatchOutcome::ReplyStored {
                    request_id,
                    replies,
                }
            }
            Message::Query(query) => {
                let Some(handler) = &self.handler else {
                    debug!("Dropping {} from {}: not a provider", query.command, from);
                    return DispatchOutcome::NoHandler;
                };
                let request_id = query.request_id.clone();
                let Some(payload) = handler.handle_query(&from, &query).await else {
                    return DispatchOutcome::Forwarded { replied: false };
                };
                let reply = Message::Reply(ReplyMessage {
                    request_id,
                    payload,
                });
                let replied = self.send(&from, &reply).await;
                DispatchOutcome::Forwarded { replied }
            }
        }
    }

    async fn serve_config(&self, from: &PeerAddr, request: ConfigRequest) -> DispatchOutcome {
        let key = Command::GetConfig.name();
        if !self
            .config_requests
            .check_and_record(from, key, self.config_interval)
        {
            self.reject(from, "too many config requests".to_string());
            return DispatchOutcome::ConfigRateLimited;
        }

        let (config, addr) = match &request.target {
            ConfigTarget::SelfNode => (self.local_config(), SELF_TARGET.to_string()),
            ConfigTarget::Peer(addr) => (self.cache.get(addr), addr.to_string()),
        };
        let Some(config) = config else {
            debug!("No config for {} requested by {}", addr, from);
            return DispatchOutcome::ConfigUnavailable;
        };

        let manifest_json = match config.to_reply_json(&addr) {
            Ok(json) => json,
            Err(e) => {
                warn!("Cannot serialize config for {}: {}", addr, e);
                return DispatchOutcome::ConfigUnavailable;
            }
        };
        let reply = Message::ConfigReply(ConfigReply {
            request_id: request.request_id.clone(),
            manifest_json,
        });
        if self.send(from, &reply).await {
            info!("Sent config of {} to {}", addr, from);
        }
        DispatchOutcome::ConfigServed(request.request_id)
    }

    async fn send(&self, to: &PeerAddr, message: &Message) -> bool {
        let bytes = match message.encode(None) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode {} for {}: {}", message.message_type(), to, e);
                return false;
            }
        };
        match self.transport.send(to, CHANNEL_TAG, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {} to {}: {}", message.message_type(), to, e);
                false
            }
        }
    }
}
