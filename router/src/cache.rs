//! Cached provider configs and the domain table

use meshquery_core::{PeerAddr, ProviderConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct CachedConfig {
    config: Arc<ProviderConfig>,
    /// Position of the first insert; kept across replacements
    seq: u64,
}

#[derive(Default)]
struct CacheInner {
    configs: HashMap<PeerAddr, CachedConfig>,
    domains: HashMap<String, PeerAddr>,
    next_seq: u64,
}

/// Provider configs keyed by peer address.
///
/// Entries are swapped whole behind an `Arc`, so a reader holding one never
/// observes a partially updated manifest. Every stored peer is also reachable
/// through its own address as a domain key; a manifest that declares a domain
/// takes that name over from any previous owner.
#[derive(Default)]
pub struct ConfigCache {
    inner: RwLock<CacheInner>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the config for `addr`
    pub fn insert(&self, addr: PeerAddr, config: ProviderConfig) {
        let config = Arc::new(config);
        let mut inner = self.inner.write();

        let seq = match inner.configs.get(&addr).map(|c| c.seq) {
            Some(seq) => seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };

        inner
            .domains
            .insert(addr.as_str().to_string(), addr.clone());
        if let Some(domain) = config.manifest.domain() {
            if let Some(previous) = inner.domains.insert(domain.to_string(), addr.clone()) {
                if previous != addr {
                    info!("Domain {} moved from {} to {}", domain, previous, addr);
                }
            }
        }

        debug!("Cached config for {}", addr);
        inner.configs.insert(addr, CachedConfig { config, seq });
    }

    pub fn get(&self, addr: &PeerAddr) -> Option<Arc<ProviderConfig>> {
        self.inner.read().configs.get(addr).map(|c| c.config.clone())
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.inner.read().configs.contains_key(addr)
    }

    /// All cached configs in first-insert order
    pub fn entries(&self) -> Vec<(PeerAddr, Arc<ProviderConfig>)> {
        let inner = self.inner.read();
        let mut entries: Vec<(u64, PeerAddr, Arc<ProviderConfig>)> = inner
            .configs
            .iter()
            .map(|(addr, c)| (c.seq, addr.clone(), c.config.clone()))
            .collect();
        entries.sort_by_key(|(seq, _, _)| *seq);
        entries
            .into_iter()
            .map(|(_, addr, config)| (addr, config))
            .collect()
    }

    /// Current owner of `domain`
    pub fn resolve_domain(&self, domain: &str) -> Option<PeerAddr> {
        self.inner.read().domains.get(domain).cloned()
    }

    /// Every cached peer whose manifest claims `domain`, in first-insert
    /// order. Empty when the domain is unknown.
    pub fn candidates_for_domain(&self, domain: &str) -> Vec<PeerAddr> {
        let Some(owner) = self.resolve_domain(domain) else {
            return Vec::new();
        };
        let mut candidates: Vec<PeerAddr> = self
            .entries()
            .into_iter()
            .filter(|(addr, config)| {
                addr.as_str() == domain || config.manifest.domain() == Some(domain)
            })
            .map(|(addr, _)| addr)
            .collect();
        if candidates.is_empty() {
            candidates.push(owner);
        }
        candidates
    }

    pub fn domains(&self) -> Vec<(String, PeerAddr)> {
        let mut domains: Vec<(String, PeerAddr)> = self
            .inner
            .read()
            .domains
            .iter()
            .map(|(d, a)| (d.clone(), a.clone()))
            .collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.inner.read().configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
