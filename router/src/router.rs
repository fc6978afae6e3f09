//! The router service
//!
//! `Router` owns every table the routing core needs (cached provider
//! configs, rate windows, scores, pending replies, payment channels) and
//! exposes the typed query surface. Each query is one round of
//! select → pay → dispatch → wait → resolve. Errors never escape as
//! anything but an [`ErrorReply`].

use meshquery_consensus::{Consensus, Reply};
use meshquery_core::{
    unix_now, Amount, Command, DomainVerifier, ErrorReply, PeerAddr, ProviderConfig,
    ProviderRegistry, QueryResult, RequestId, RouterConfig, RouterError, RouterResult,
    StakeProof, StakeProvider, Transport, CHANNEL_TAG,
};
use meshquery_p2p::{ConfigTarget, InboundPacket};
use meshquery_payment::{PaymentEngine, PaymentTarget, PaymentToken};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ConfigCache;
use crate::correlator::{Correlator, OutboundQuery};
use crate::dispatcher::{DispatchOutcome, InboundDispatcher, SharedLocalConfig};
use crate::handler::ProviderHandler;
use crate::rate::RateLimiter;
use crate::selection::{PeerQualifier, ScoreBoard};
use crate::sync::ConfigSync;
use crate::validation::{resolve_confirmations, validate_params};

/// Domain verifier for nodes without chain access: nothing verifies
pub struct NoDomainVerifier;

impl DomainVerifier for NoDomainVerifier {
    fn verify_domain(&self, _tx: &str, _domain: &str, _payment_address: &str) -> Option<u64> {
        None
    }
}

/// Decentralized query router
pub struct Router {
    config: RouterConfig,
    transport: Arc<dyn Transport>,
    stake: Arc<dyn StakeProvider>,
    verifier: Arc<dyn DomainVerifier>,
    payments: Arc<PaymentEngine>,
    cache: Arc<ConfigCache>,
    scores: Arc<ScoreBoard>,
    qualifier: PeerQualifier,
    sync: Arc<ConfigSync>,
    correlator: Arc<Correlator>,
    dispatcher: InboundDispatcher,
    local: SharedLocalConfig,
    manifest_path: Option<PathBuf>,
    handler: Option<Arc<dyn ProviderHandler>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    pub fn scores(&self) -> &Arc<ScoreBoard> {
        &self.scores
    }

    pub fn payments(&self) -> &Arc<PaymentEngine> {
        &self.payments
    }

    fn local_config(&self) -> Option<Arc<ProviderConfig>> {
        self.local.read().clone()
    }

    fn ensure_enabled(&self) -> RouterResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(RouterError::Unauthorized(
                "router is turned off; set router.enabled = true to use it".to_string(),
            ))
        }
    }

    fn stake_proof(&self) -> RouterResult<StakeProof> {
        self.stake.satisfy_minimum_stake().map_err(|e| match e {
            RouterError::InsufficientFunds(_) => e,
            other => RouterError::InsufficientFunds(format!(
                "minimum stake requirement not satisfied: {}",
                other
            )),
        })
    }

    // ============ Inbound ============

    /// Route one inbound packet
    pub async fn handle_packet(&self, packet: InboundPacket) -> DispatchOutcome {
        self.dispatcher.dispatch(packet).await
    }

    /// Process inbound packets until the channel closes
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundPacket>) {
        while let Some(packet) = inbound.recv().await {
            let outcome = self.handle_packet(packet).await;
            debug!("Inbound packet: {:?}", outcome);
        }
        info!("Inbound channel closed");
    }

    pub fn spawn(self: &Arc<Self>, inbound: mpsc::Receiver<InboundPacket>) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move { router.run(inbound).await })
    }

    // ============ Peers and configs ============

    /// Connect to ranked providers not yet peered with and ask each new
    /// peer for its config. Returns the number of new connections.
    pub async fn open_connections(&self, service: Option<&str>) -> usize {
        let connected = self.qualifier.open_connections(service).await;
        for peer in &connected {
            if let Err(e) = self.sync.request_config(peer, ConfigTarget::SelfNode).await {
                warn!("Config request to {} failed: {}", peer, e);
            }
        }
        connected.len()
    }

    /// Ask connected providers without a cached config for theirs
    pub async fn refresh_configs(&self) -> usize {
        self.sync.refresh_all().await
    }

    pub async fn request_config(
        &self,
        peer: &PeerAddr,
        target: ConfigTarget,
    ) -> RouterResult<RequestId> {
        self.sync.request_config(peer, target).await
    }

    /// Providers a `command` on `chain` may be sent to, best first
    pub async fn select_peers(
        &self,
        command: Command,
        chain: &str,
        needed: usize,
    ) -> RouterResult<Vec<PeerAddr>> {
        self.open_connections(None).await;
        self.refresh_configs().await;
        self.qualifier.select_peers(command, chain, needed).await
    }

    // ============ Payments ============

    fn payment_target(&self, peer: &PeerAddr, config: &ProviderConfig) -> PaymentTarget {
        PaymentTarget::new(
            self.qualifier.payment_address(peer),
            config.manifest.deposit_pubkey(),
        )
    }

    /// Build payments for the first `needed` peers that can be paid. If
    /// fewer than `needed` could be, every token built is released.
    fn pay_providers(
        &self,
        peers: &[PeerAddr],
        needed: usize,
        fee_of: impl Fn(&ProviderConfig) -> Amount,
    ) -> RouterResult<Vec<(PeerAddr, PaymentToken)>> {
        let mut paid = Vec::with_capacity(needed);
        for peer in peers {
            if paid.len() == needed {
                break;
            }
            let Some(config) = self.cache.get(peer) else {
                continue;
            };
            let target = self.payment_target(peer, &config);
            match self.payments.build_payment(&target, fee_of(&config)) {
                Ok(token) => paid.push((peer.clone(), token)),
                Err(e) => warn!("Failed to create payment to {}: {}", peer, e),
            }
        }

        if paid.len() < needed {
            for (_, token) in &paid {
                self.payments.release(token);
            }
            return Err(RouterError::InsufficientFunds(format!(
                "could not create payments to {} providers; check that the wallet is unlocked \
                 and has enough spendable outputs",
                needed
            )));
        }
        Ok(paid)
    }

    fn record_scores(&self, consensus: &Consensus) {
        for peer in &consensus.agreeing {
            self.scores.adjust(peer, 1);
        }
        for peer in &consensus.dissenting {
            let score = self.scores.adjust(peer, -1);
            debug!("{} disagreed with consensus, score now {}", peer, score);
        }
    }

    // ============ Queries ============

    fn render(request_id: Option<RequestId>, outcome: RouterResult<Reply>) -> QueryResult {
        let id = request_id.unwrap_or_else(|| RequestId::from(""));
        match outcome {
            Ok(reply) => reply.into_result(&id),
            Err(e) => {
                warn!("Query {} failed: {}", id, e);
                Err(e.into_reply(id.as_str()))
            }
        }
    }

    /// One consensus round for `command`. Empty parameters are not sent.
    pub async fn call(
        &self,
        command: Command,
        chain: &str,
        param1: &str,
        param2: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        let mut request_id = None;
        let outcome = self
            .run_query(command, chain, param1, param2, confirmations, &mut request_id)
            .await;
        Self::render(request_id, outcome)
    }

    async fn run_query(
        &self,
        command: Command,
        chain: &str,
        param1: &str,
        param2: &str,
        confirmations: Option<u32>,
        request_id: &mut Option<RequestId>,
    ) -> RouterResult<Reply> {
        self.ensure_enabled()?;
        let stake = self.stake_proof()?;
        validate_params(command, param1, param2)?;
        let needed = resolve_confirmations(confirmations, self.config.consensus_nodes)?;

        let (id, _) = self.correlator.register();
        *request_id = Some(id.clone());
        info!("Sending {} on {} as {}", command, chain, id);

        let peers = self.select_peers(command, chain, needed).await?;
        let targets = self.pay_providers(&peers, needed, |config| {
            config.manifest.command_fee(command, chain)
        })?;

        let query = OutboundQuery {
            command,
            chain: chain.to_string(),
            params: [param1, param2]
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_string())
                .collect(),
            rate_key: command.rate_key(chain),
        };
        self.correlator.dispatch(&id, &query, &stake, targets).await;

        let consensus = self
            .correlator
            .await_consensus(&id, needed, self.config.wait())
            .await?;
        self.record_scores(&consensus);
        Ok(consensus.answer)
    }

    pub async fn get_block_count(&self, chain: &str, confirmations: Option<u32>) -> QueryResult {
        self.call(Command::GetBlockCount, chain, "", "", confirmations)
            .await
    }

    pub async fn get_block_hash(
        &self,
        chain: &str,
        block: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(Command::GetBlockHash, chain, block, "", confirmations)
            .await
    }

    pub async fn get_block(
        &self,
        chain: &str,
        block_hash: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(Command::GetBlock, chain, block_hash, "", confirmations)
            .await
    }

    pub async fn get_transaction(
        &self,
        chain: &str,
        tx_hash: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(Command::GetTransaction, chain, tx_hash, "", confirmations)
            .await
    }

    pub async fn get_all_blocks(
        &self,
        chain: &str,
        from_block: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(Command::GetAllBlocks, chain, from_block, "", confirmations)
            .await
    }

    pub async fn get_all_transactions(
        &self,
        chain: &str,
        account: &str,
        from_block: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(
            Command::GetAllTransactions,
            chain,
            account,
            from_block,
            confirmations,
        )
        .await
    }

    pub async fn get_balance(
        &self,
        chain: &str,
        account: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(Command::GetBalance, chain, account, "", confirmations)
            .await
    }

    pub async fn get_balance_update(
        &self,
        chain: &str,
        account: &str,
        from_block: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(
            Command::GetBalanceUpdate,
            chain,
            account,
            from_block,
            confirmations,
        )
        .await
    }

    pub async fn get_transactions_bloom_filter(
        &self,
        chain: &str,
        filter: &str,
        from_block: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(
            Command::GetTransactionsBloomFilter,
            chain,
            filter,
            from_block,
            confirmations,
        )
        .await
    }

    /// Broadcast a raw transaction through a single provider
    pub async fn send_transaction(&self, chain: &str, raw_tx: &str) -> QueryResult {
        self.call(Command::SendTransaction, chain, raw_tx, "", Some(1))
            .await
    }

    pub async fn convert_time_to_block_count(
        &self,
        chain: &str,
        time: &str,
        confirmations: Option<u32>,
    ) -> QueryResult {
        self.call(Command::TimeToBlockNumber, chain, time, "", confirmations)
            .await
    }

    /// Call plugin `name` (optionally `domain/plugin`). Plugins this node
    /// serves itself run locally.
    pub async fn send_custom_call(&self, name: &str, params: &[String]) -> QueryResult {
        let mut request_id = None;
        let outcome = self.run_custom_call(name, params, &mut request_id).await;
        Self::render(request_id, outcome)
    }

    async fn run_custom_call(
        &self,
        name: &str,
        params: &[String],
        request_id: &mut Option<RequestId>,
    ) -> RouterResult<Reply> {
        self.ensure_enabled()?;

        let served_here = self
            .local_config()
            .map(|c| c.has_plugin(name))
            .unwrap_or(false);
        if served_here {
            if let Some(handler) = &self.handler {
                debug!("Running plugin {} locally", name);
                return handler.process_custom_call(name, params).await.map(Reply::Data);
            }
        }

        let stake = self.stake_proof()?;
        let (id, _) = self.correlator.register();
        *request_id = Some(id.clone());

        let service = if name.contains('/') {
            None
        } else {
            Some(format!("{}::{}", CHANNEL_TAG, name))
        };
        self.open_connections(service.as_deref()).await;
        self.refresh_configs().await;

        let not_found = || RouterError::UnsupportedService(format!("plugin {} not found", name));
        let target = self
            .qualifier
            .select_peer_for_plugin(name)
            .await
            .ok_or_else(not_found)?;
        let settings = target.config.plugin(&target.plugin).ok_or_else(not_found)?;
        settings.accepts_param_count(params.len())?;

        let payment = self.payment_target(&target.peer, &target.config);
        let token = self.payments.build_payment(&payment, settings.fee())?;

        let query = OutboundQuery {
            command: Command::CustomCall,
            chain: target.plugin.clone(),
            params: params.to_vec(),
            rate_key: target.plugin.clone(),
        };
        info!("Calling plugin {} on {} as {}", target.plugin, target.peer, id);
        self.correlator
            .dispatch(&id, &query, &stake, vec![(target.peer.clone(), token)])
            .await;

        let consensus = self
            .correlator
            .await_consensus(&id, 1, self.config.wait())
            .await?;
        Ok(consensus.answer)
    }

    /// Every reply stored for `id`, including ones that arrived late
    pub fn get_reply(&self, id: &str) -> QueryResult {
        let id = RequestId::from(id);
        match self.correlator.replies(&id) {
            Some(replies) if !replies.is_empty() => Ok(replies.to_json(&id)),
            _ => Err(ErrorReply {
                error: "No replies found".to_string(),
                code: RouterError::BadRequest(String::new()).code(),
                uuid: id.to_string(),
            }),
        }
    }

    // ============ Introspection ============

    fn describe(config: &ProviderConfig) -> serde_json::Value {
        let plugins: serde_json::Map<String, serde_json::Value> = config
            .plugins
            .iter()
            .map(|(name, p)| (name.clone(), p.raw_text().into()))
            .collect();
        serde_json::json!({
            "config": config.manifest.raw_text(),
            "plugins": plugins,
        })
    }

    /// Local manifest and every cached provider config
    pub fn status(&self) -> serde_json::Value {
        let mut status = match self.local_config() {
            Some(local) => Self::describe(&local),
            None => serde_json::json!({ "config": "", "plugins": {} }),
        };
        let nodes: Vec<serde_json::Value> = self
            .cache
            .entries()
            .into_iter()
            .map(|(addr, config)| {
                let mut node = Self::describe(&config);
                node["node"] = addr.as_str().into();
                node
            })
            .collect();
        status["enabled"] = self.config.enabled.into();
        status["nodes"] = nodes.into();
        status
    }

    /// Raw manifests of all cached providers
    pub fn print_configs(&self) -> serde_json::Value {
        let configs: Vec<serde_json::Value> = self
            .cache
            .entries()
            .into_iter()
            .map(|(addr, config)| {
                serde_json::json!({ "node": addr.as_str(), "config": config.manifest.raw_text() })
            })
            .collect();
        configs.into()
    }

    pub fn print_payment_channels(&self) -> serde_json::Value {
        self.payments.print_channels(unix_now())
    }

    /// Service tags this node announces
    pub fn services(&self) -> Vec<String> {
        match self.local_config() {
            Some(config) => config.service_tags(CHANNEL_TAG),
            None => vec![CHANNEL_TAG.to_string()],
        }
    }

    /// True when `domain` is owned by a connected provider whose
    /// registration transaction verifies
    pub async fn query_domain(&self, domain: &str) -> bool {
        self.open_connections(None).await;
        self.refresh_configs().await;

        let Some(owner) = self.cache.resolve_domain(domain) else {
            return false;
        };
        let Some(config) = self.cache.get(&owner) else {
            return false;
        };
        let Some(tx) = config.manifest.domain_tx() else {
            return false;
        };
        if !self.transport.is_connected(&owner) {
            return false;
        }
        let payment_address = self.qualifier.payment_address(&owner);
        self.verifier
            .verify_domain(tx, domain, &payment_address)
            .is_some()
    }

    /// Re-read the local manifest and plugins from disk
    pub fn reload_manifest(&self) -> RouterResult<()> {
        let path = self
            .manifest_path
            .as_ref()
            .ok_or_else(|| RouterError::Config("no manifest path configured".to_string()))?;
        info!("Reloading provider manifest from {}", path.display());
        let config = ProviderConfig::load(path)?;
        *self.local.write() = Some(Arc::new(config));
        Ok(())
    }
}

/// Builder for [`Router`]
#[derive(Default)]
pub struct RouterBuilder {
    config: RouterConfig,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<dyn ProviderRegistry>>,
    stake: Option<Arc<dyn StakeProvider>>,
    payments: Option<Arc<PaymentEngine>>,
    verifier: Option<Arc<dyn DomainVerifier>>,
    handler: Option<Arc<dyn ProviderHandler>>,
    local: Option<ProviderConfig>,
    manifest_path: Option<PathBuf>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn stake(mut self, stake: Arc<dyn StakeProvider>) -> Self {
        self.stake = Some(stake);
        self
    }

    pub fn payments(mut self, payments: Arc<PaymentEngine>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn DomainVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Serve queries with `handler`
    pub fn handler(mut self, handler: Arc<dyn ProviderHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Manifest advertised to peers
    pub fn local_config(mut self, config: ProviderConfig) -> Self {
        self.local = Some(config);
        self
    }

    /// Load the local manifest from `path`; also used by `reload_manifest`
    pub fn manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    pub fn build(self) -> RouterResult<Router> {
        let missing = |what: &str| RouterError::Config(format!("router needs a {}", what));
        let transport = self.transport.ok_or_else(|| missing("transport"))?;
        let registry = self.registry.ok_or_else(|| missing("provider registry"))?;
        let stake = self.stake.ok_or_else(|| missing("stake provider"))?;
        let payments = self.payments.ok_or_else(|| missing("payment engine"))?;
        let verifier = self
            .verifier
            .unwrap_or_else(|| Arc::new(NoDomainVerifier) as Arc<dyn DomainVerifier>);

        let local = match (self.local, &self.manifest_path) {
            (Some(config), _) => Some(Arc::new(config)),
            (None, Some(path)) => Some(Arc::new(ProviderConfig::load(path)?)),
            (None, None) => None,
        };
        let local: SharedLocalConfig = Arc::new(RwLock::new(local));

        let config = self.config;
        let cache = Arc::new(ConfigCache::new());
        let rates = Arc::new(RateLimiter::new());
        let scores = Arc::new(ScoreBoard::new());

        let qualifier = PeerQualifier::new(
            transport.clone(),
            registry.clone(),
            verifier.clone(),
            cache.clone(),
            rates.clone(),
            scores.clone(),
            config.clone(),
        );
        let sync = Arc::new(ConfigSync::new(
            transport.clone(),
            registry.clone(),
            cache.clone(),
            Duration::from_secs(config.config_refresh_secs),
            config.query_all_peers,
        ));
        let correlator = Arc::new(Correlator::new(
            transport.clone(),
            registry,
            payments.clone(),
            rates,
            Duration::from_secs(config.reply_retention_secs),
        ));
        let dispatcher = InboundDispatcher::new(
            config.enabled,
            transport.clone(),
            cache.clone(),
            sync.clone(),
            correlator.clone(),
            local.clone(),
            self.handler.clone(),
            Duration::from_secs(config.config_request_interval_secs),
        );

        if !config.enabled {
            warn!("Router is disabled; queries will be refused");
        }

        Ok(Router {
            config,
            transport,
            stake,
            verifier,
            payments,
            cache,
            scores,
            qualifier,
            sync,
            correlator,
            dispatcher,
            local,
            manifest_path: self.manifest_path,
            handler: self.handler,
        })
    }
}
