//! Provider config synchronization

use meshquery_core::{
    PeerAddr, ProviderConfig, ProviderRegistry, RequestId, RouterResult, StakeRef, Transport,
    CHANNEL_TAG,
};
use meshquery_p2p::{ConfigReply, ConfigRequest, ConfigTarget, Message, SELF_TARGET};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::ConfigCache;

/// Fetches provider manifests and keeps the [`ConfigCache`] filled
pub struct ConfigSync {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ProviderRegistry>,
    cache: Arc<ConfigCache>,
    /// When each peer was last asked for its config
    last_requested: Mutex<HashMap<PeerAddr, Instant>>,
    /// Outstanding requests for a peer's own config
    outstanding: Mutex<HashMap<RequestId, PeerAddr>>,
    refresh_interval: Duration,
    query_all_peers: bool,
}

impl ConfigSync {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ProviderRegistry>,
        cache: Arc<ConfigCache>,
        refresh_interval: Duration,
        query_all_peers: bool,
    ) -> Self {
        Self {
            transport,
            registry,
            cache,
            last_requested: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
            refresh_interval,
            query_all_peers,
        }
    }

    /// Ask `peer` for its own config, or for one it cached for another peer
    pub async fn request_config(
        &self,
        peer: &PeerAddr,
        target: ConfigTarget,
    ) -> RouterResult<RequestId> {
        let request_id = RequestId::generate();
        let message = Message::ConfigRequest(ConfigRequest {
            stake: StakeRef::default(),
            request_id: request_id.clone(),
            target: target.clone(),
        });
        let bytes = message.encode(None)?;

        if target == ConfigTarget::SelfNode {
            self.outstanding
                .lock()
                .insert(request_id.clone(), peer.clone());
        }
        self.last_requested.lock().insert(peer.clone(), Instant::now());

        if let Err(e) = self.transport.send(peer, CHANNEL_TAG, bytes).await {
            self.outstanding.lock().remove(&request_id);
            return Err(e);
        }
        debug!("Requested config from {} (request {})", peer, request_id);
        Ok(request_id)
    }

    fn recently_requested(&self, peer: &PeerAddr, now: Instant) -> bool {
        self.last_requested
            .lock()
            .get(peer)
            .map(|at| now.saturating_duration_since(*at) < self.refresh_interval)
            .unwrap_or(false)
    }

    /// Request configs from connected peers we have none for.
    ///
    /// Each peer is asked at most once per refresh interval. Unless
    /// `query_all_peers` is set only ranked providers are asked. Returns the
    /// number of requests sent.
    pub async fn refresh_all(&self) -> usize {
        let now = Instant::now();
        let mut sent = 0;
        for peer in self.transport.connected_peers() {
            if self.cache.contains(&peer) || self.recently_requested(&peer, now) {
                continue;
            }
            if !self.query_all_peers && self.registry.find(&peer).is_none() {
                continue;
            }
            match self.request_config(&peer, ConfigTarget::SelfNode).await {
                Ok(_) => sent += 1,
                Err(e) => warn!("Config request to {} failed: {}", peer, e),
            }
        }
        sent
    }

    /// Store the manifest carried by a config reply.
    ///
    /// A reply to one of our own requests is filed under the peer we asked.
    /// Otherwise the document's `addr` field names the provider, falling
    /// back to the sender.
    pub fn handle_config_reply(&self, from: &PeerAddr, reply: ConfigReply) -> RouterResult<PeerAddr> {
        let (config, addr) = ProviderConfig::from_reply_json(&reply.manifest_json)?;
        let provider = match self.outstanding.lock().remove(&reply.request_id) {
            Some(asked) => asked,
            None if !addr.is_empty() && addr != SELF_TARGET => PeerAddr(addr),
            None => from.clone(),
        };
        info!(
            "Got config from {} for {} ({} plugins)",
            from,
            provider,
            config.plugins.len()
        );
        self.cache.insert(provider.clone(), config);
        Ok(provider)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshquery_core::{PluginSettings, ProviderInfo, ProviderManifest, RouterError};
    use meshquery_p2p::MemoryNetwork;

    struct Ranked(Vec<PeerAddr>);

    impl ProviderRegistry for Ranked {
        fn ranked_providers(&self) -> Vec<(u32, ProviderInfo)> {
            self.0
                .iter()
                .map(|addr| {
                    (
                        0,
                        ProviderInfo {
                            address: addr.clone(),
                            services: vec![CHANNEL_TAG.into()],
                            payment_address: String::new(),
                            pubkey: String::new(),
                        },
                    )
                })
                .collect()
        }
    }

    fn manifest_json(domain: &str, addr: &str) -> String {
        let mut config = ProviderConfig::new(
            ProviderManifest::parse(&format!("[main]\nchains = [\"BTC\"]\ndomain = \"{}\"\n", domain))
                .unwrap(),
        );
        config.add_plugin("echo", PluginSettings::parse("max_params = 3").unwrap());
        config.to_reply_json(addr).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_is_throttled_per_peer() {
        let network = MemoryNetwork::new();
        let (client, _rx) = network.endpoint("client:1", 8);
        let (_p, mut provider_rx) = network.endpoint("p:1", 8);
        let (_q, _q_rx) = network.endpoint("q:1", 8);
        let client = Arc::new(client);
        client.connect(&"p:1".into()).await.unwrap();
        client.connect(&"q:1".into()).await.unwrap();

        let sync = ConfigSync::new(
            client,
            Arc::new(Ranked(vec!["p:1".into()])),
            Arc::new(ConfigCache::new()),
            Duration::from_secs(300),
            false,
        );

        // q:1 is not a ranked provider
        assert_eq!(sync.refresh_all().await, 1);
        assert_eq!(sync.refresh_all().await, 0);
        assert_eq!(sync.outstanding(), 1);

        let packet = provider_rx.recv().await.unwrap();
        let (message, _) = Message::decode(&packet.bytes).unwrap();
        match message {
            Message::ConfigRequest(req) => assert_eq!(req.target, ConfigTarget::SelfNode),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_is_filed_under_requested_peer() {
        let network = MemoryNetwork::new();
        let (client, _rx) = network.endpoint("client:1", 8);
        let (_p, _p_rx) = network.endpoint("p:1", 8);
        let client = Arc::new(client);
        client.connect(&"p:1".into()).await.unwrap();
        let cache = Arc::new(ConfigCache::new());
        let sync = ConfigSync::new(
            client,
            Arc::new(Ranked(vec![])),
            cache.clone(),
            Duration::from_secs(300),
            true,
        );

        let id = sync
            .request_config(&"p:1".into(), ConfigTarget::SelfNode)
            .await
            .unwrap();
        let stored = sync
            .handle_config_reply(
                &"p:1".into(),
                ConfigReply {
                    request_id: id,
                    manifest_json: manifest_json("blocks", SELF_TARGET),
                },
            )
            .unwrap();

        assert_eq!(stored, PeerAddr::from("p:1"));
        assert!(cache.get(&stored).unwrap().has_plugin("echo"));
        assert_eq!(cache.resolve_domain("blocks"), Some(stored.clone()));
        assert_eq!(cache.resolve_domain("p:1"), Some(stored));
        assert_eq!(sync.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_relayed_reply_uses_addr_field() {
        let network = MemoryNetwork::new();
        let (client, _rx) = network.endpoint("client:1", 8);
        let (_p, _p_rx) = network.endpoint("p:1", 8);
        let client = Arc::new(client);
        client.connect(&"p:1".into()).await.unwrap();
        let cache = Arc::new(ConfigCache::new());
        let sync = ConfigSync::new(
            client,
            Arc::new(Ranked(vec![])),
            cache.clone(),
            Duration::from_secs(300),
            false,
        );

        let stored = sync
            .handle_config_reply(
                &"p:1".into(),
                ConfigReply {
                    request_id: RequestId::from("unsolicited"),
                    manifest_json: manifest_json("far", "r:9"),
                },
            )
            .unwrap();
        assert_eq!(stored, PeerAddr::from("r:9"));
        assert_eq!(cache.resolve_domain("far"), Some("r:9".into()));

        let err = sync
            .handle_config_reply(
                &"p:1".into(),
                ConfigReply {
                    request_id: RequestId::from("x"),
                    manifest_json: "{not json".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, RouterError::Serialization(_)));
    }
}
