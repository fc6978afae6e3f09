//! Peer qualification
//!
//! Picks the providers a query is sent to. A cached provider qualifies when
//! it serves the chain and command, charges no more than the caller's fee
//! ceiling and its rate window for this client has elapsed. Survivors are
//! ordered by score.

use futures::future::join_all;
use meshquery_core::{
    Command, DomainVerifier, PeerAddr, ProviderConfig, ProviderRegistry, RouterConfig,
    RouterError, RouterResult, Transport, CHANNEL_TAG,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::ConfigCache;
use crate::rate::RateLimiter;

/// Peer quality scores fed back from consensus rounds
#[derive(Debug, Default)]
pub struct ScoreBoard {
    scores: RwLock<HashMap<PeerAddr, i64>>,
}

impl ScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, peer: &PeerAddr) -> i64 {
        self.scores.read().get(peer).copied().unwrap_or(0)
    }

    pub fn adjust(&self, peer: &PeerAddr, delta: i64) -> i64 {
        let mut scores = self.scores.write();
        let score = scores.entry(peer.clone()).or_insert(0);
        *score = score.saturating_add(delta);
        *score
    }

    pub fn snapshot(&self) -> HashMap<PeerAddr, i64> {
        self.scores.read().clone()
    }
}

/// Provider chosen for a plugin call
#[derive(Debug, Clone)]
pub struct PluginTarget {
    pub peer: PeerAddr,
    pub config: Arc<ProviderConfig>,
    /// Plugin name without any domain qualifier
    pub plugin: String,
}

/// Filters cached providers down to the ones a query may go to
pub struct PeerQualifier {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ProviderRegistry>,
    verifier: Arc<dyn DomainVerifier>,
    cache: Arc<ConfigCache>,
    rates: Arc<RateLimiter>,
    scores: Arc<ScoreBoard>,
    config: RouterConfig,
}

impl PeerQualifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ProviderRegistry>,
        verifier: Arc<dyn DomainVerifier>,
        cache: Arc<ConfigCache>,
        rates: Arc<RateLimiter>,
        scores: Arc<ScoreBoard>,
        config: RouterConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            verifier,
            cache,
            rates,
            scores,
            config,
        }
    }

    /// Connected peer for `addr`, connecting on demand
    async fn ensure_connected(&self, addr: &PeerAddr) -> Option<PeerAddr> {
        if self.transport.is_connected(addr) {
            return Some(addr.clone());
        }
        self.transport.connect(addr).await
    }

    /// Qualified peers for `command` on `chain`, best score first.
    ///
    /// Fails with `UnsupportedBlockchain`, `MaxFeeTooLow` or `NotEnoughNodes`
    /// depending on which filter left fewer than `needed` peers.
    pub async fn select_peers(
        &self,
        command: Command,
        chain: &str,
        needed: usize,
    ) -> RouterResult<Vec<PeerAddr>> {
        let key = command.rate_key(chain);
        let max_fee = self.config.max_fee_for(&key);

        let mut supported = 0;
        let mut below_max_fee = 0;
        let mut ready = 0;
        let mut selected = Vec::new();

        for (addr, config) in self.cache.entries() {
            let manifest = &config.manifest;
            if !manifest.is_available(command, chain) {
                continue;
            }
            supported += 1;

            let Some(peer) = self.ensure_connected(&addr).await else {
                debug!("Skipping {}: not reachable", addr);
                continue;
            };

            if let Some(max_fee) = max_fee {
                let fee = manifest.command_fee(command, chain);
                if fee > max_fee {
                    debug!("Skipping {}: fee {} above max fee {}", peer, fee, max_fee);
                    continue;
                }
            }
            below_max_fee += 1;

            let window = manifest.command_timeout(command, chain);
            if !self.rates.is_ready(&peer, &key, window) {
                debug!("Skipping {}: called {} too recently", peer, key);
                continue;
            }
            ready += 1;
            selected.push(peer);
        }

        if supported < needed {
            return Err(RouterError::UnsupportedBlockchain(format!(
                "could not find {} providers supporting {}",
                needed, chain
            )));
        }
        if below_max_fee < needed {
            return Err(RouterError::MaxFeeTooLow {
                found: below_max_fee,
                needed,
            });
        }
        if ready < needed {
            return Err(RouterError::NotEnoughNodes {
                found: ready,
                needed,
            });
        }

        // stable: equal scores keep cache order
        selected.sort_by_key(|peer| std::cmp::Reverse(self.scores.score(peer)));
        debug!("Selected {} providers for {}", selected.len(), key);
        Ok(selected)
    }

    /// Single provider for plugin `name`, which may be `domain/plugin`
    pub async fn select_peer_for_plugin(&self, name: &str) -> Option<PluginTarget> {
        let target = match name.split_once('/') {
            Some((domain, plugin)) => self.resolve_domain_plugin(domain, plugin).await?,
            None => self.find_plugin(name).await?,
        };

        let settings = target.config.plugin(&target.plugin)?;
        if !self
            .rates
            .is_ready(&target.peer, &target.plugin, settings.timeout())
        {
            debug!("Skipping {}: plugin {} called too recently", target.peer, target.plugin);
            return None;
        }
        if let Some(max_fee) = self.config.max_fee_for(&target.plugin) {
            if settings.fee() > max_fee {
                debug!("Skipping {}: plugin fee {} above max fee", target.peer, settings.fee());
                return None;
            }
        }
        Some(target)
    }

    async fn resolve_domain_plugin(&self, domain: &str, plugin: &str) -> Option<PluginTarget> {
        let mut candidates = Vec::new();
        for addr in self.cache.candidates_for_domain(domain) {
            let Some(config) = self.cache.get(&addr) else {
                continue;
            };
            if !config.has_plugin(plugin) {
                continue;
            }
            if let Some(peer) = self.ensure_connected(&addr).await {
                candidates.push((peer, config));
            }
        }

        let (peer, config) = match candidates.len() {
            0 => return None,
            1 => candidates.remove(0),
            _ => self.verified_owner(domain, candidates)?,
        };
        Some(PluginTarget {
            peer,
            config,
            plugin: plugin.to_string(),
        })
    }

    /// Among several claimants of `domain`, the one whose registration is
    /// confirmed in the lowest block. Ties go to the first seen.
    fn verified_owner(
        &self,
        domain: &str,
        candidates: Vec<(PeerAddr, Arc<ProviderConfig>)>,
    ) -> Option<(PeerAddr, Arc<ProviderConfig>)> {
        let mut best: Option<(u64, PeerAddr, Arc<ProviderConfig>)> = None;
        for (peer, config) in candidates {
            let Some(tx) = config.manifest.domain_tx() else {
                continue;
            };
            let payment_address = self.payment_address(&peer);
            let Some(block) = self.verifier.verify_domain(tx, domain, &payment_address) else {
                warn!("Domain {} claimed by {} does not verify", domain, peer);
                continue;
            };
            if best.as_ref().map(|(b, _, _)| block < *b).unwrap_or(true) {
                best = Some((block, peer, config));
            }
        }
        best.map(|(block, peer, config)| {
            debug!("Domain {} resolved to {} (block {})", domain, peer, block);
            (peer, config)
        })
    }

    async fn find_plugin(&self, name: &str) -> Option<PluginTarget> {
        let claimants: Vec<(PeerAddr, Arc<ProviderConfig>)> = self
            .cache
            .entries()
            .into_iter()
            .filter(|(_, config)| config.has_plugin(name))
            .collect();

        let connected = claimants
            .iter()
            .filter(|(addr, _)| self.transport.is_connected(addr))
            .count();
        if connected > 1 {
            warn!("Ambiguous plugin call: {} providers serve {}", connected, name);
            return None;
        }

        for (addr, config) in claimants {
            if let Some(peer) = self.ensure_connected(&addr).await {
                return Some(PluginTarget {
                    peer,
                    config,
                    plugin: name.to_string(),
                });
            }
        }
        None
    }

    /// Fee address of `peer` according to the ranking, empty if unranked
    pub fn payment_address(&self, peer: &PeerAddr) -> String {
        self.registry
            .find(peer)
            .map(|info| info.payment_address)
            .unwrap_or_default()
    }

    /// Connect to ranked providers we are not yet peered with.
    ///
    /// Only providers advertising the router service (and `service` when
    /// given) are contacted, at most `max_new_connections` of them, all at
    /// once. Returns the peers that connected.
    pub async fn open_connections(&self, service: Option<&str>) -> Vec<PeerAddr> {
        let targets: Vec<PeerAddr> = self
            .registry
            .ranked_providers()
            .into_iter()
            .map(|(_, info)| info)
            .filter(|info| info.has_service(CHANNEL_TAG))
            .filter(|info| service.map(|s| info.has_service(s)).unwrap_or(true))
            .filter(|info| !self.transport.is_connected(&info.address))
            .take(self.config.max_new_connections)
            .map(|info| info.address)
            .collect();

        if targets.is_empty() {
            return Vec::new();
        }

        let attempts = targets.iter().map(|addr| self.transport.connect(addr));
        let connected: Vec<PeerAddr> = join_all(attempts).await.into_iter().flatten().collect();
        if !connected.is_empty() {
            info!(
                "Opened {} of {} provider connections",
                connected.len(),
                targets.len()
            );
        }
        connected
    }
}
