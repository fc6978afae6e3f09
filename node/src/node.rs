//! Node assembly

use meshquery_core::{
    DomainVerifier, NodeConfig, ProviderRegistry, RouterError, RouterResult, StakeProvider,
    Transport, Wallet,
};
use meshquery_p2p::InboundPacket;
use meshquery_payment::PaymentEngine;
use meshquery_router::{ProviderHandler, Router};
use meshquery_state::JsonChannelStore;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};

/// A configured router plus the node settings it was built from
pub struct MeshQueryNode {
    config: NodeConfig,
    router: Arc<Router>,
}

impl MeshQueryNode {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Serve `inbound` until ctrl-c
    pub async fn start(&self, inbound: mpsc::Receiver<InboundPacket>) -> anyhow::Result<()> {
        info!("Starting MeshQuery node {}...", self.config.name);

        let inbound_handle = self.router.spawn(inbound);
        let opened = self.router.open_connections(None).await;

        info!("Node started successfully");
        info!("Services: {}", self.router.services().join(", "));
        info!("Opened {} provider connections", opened);

        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping node...");
            }
            Err(e) => {
                error!("Error waiting for shutdown signal: {}", e);
            }
        }

        inbound_handle.abort();
        info!("Node stopped");
        Ok(())
    }
}

/// Node builder; the transport, ranking, stake and wallet come from the
/// embedding application
#[derive(Default)]
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<dyn ProviderRegistry>>,
    stake: Option<Arc<dyn StakeProvider>>,
    wallet: Option<Arc<dyn Wallet>>,
    verifier: Option<Arc<dyn DomainVerifier>>,
    handler: Option<Arc<dyn ProviderHandler>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
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

    pub fn wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn DomainVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ProviderHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> RouterResult<MeshQueryNode> {
        let wallet = self
            .wallet
            .ok_or_else(|| RouterError::Config("node needs a wallet".to_string()))?;

        std::fs::create_dir_all(&self.config.data_dir)?;
        let store = Arc::new(JsonChannelStore::new(self.config.channels_path()));
        let payments = Arc::new(PaymentEngine::new(&self.config.payment, wallet, store)?);

        let mut builder = Router::builder()
            .config(self.config.router.clone())
            .payments(payments);
        if let Some(transport) = self.transport {
            builder = builder.transport(transport);
        }
        if let Some(registry) = self.registry {
            builder = builder.registry(registry);
        }
        if let Some(stake) = self.stake {
            builder = builder.stake(stake);
        }
        if let Some(verifier) = self.verifier {
            builder = builder.verifier(verifier);
        }
        if let Some(handler) = self.handler {
            builder = builder.handler(handler);
        }
        if let Some(path) = &self.config.manifest_path {
            builder = builder.manifest_path(path.clone());
        }

        let router = builder.build()?;
        info!(
            "Node {} ready, channels stored in {}",
            self.config.name,
            self.config.channels_path().display()
        );
        Ok(MeshQueryNode {
            config: self.config,
            router: Arc::new(router),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshquery_core::{
        Amount, PaymentChannel, PaymentConfig, ProviderInfo, StakeProof, StakeRef,
    };
    use meshquery_crypto::KeyPair;
    use meshquery_p2p::MemoryNetwork;
    use meshquery_payment::PaymentTarget;

    struct NoProviders;

    impl ProviderRegistry for NoProviders {
        fn ranked_providers(&self) -> Vec<(u32, ProviderInfo)> {
            Vec::new()
        }
    }

    struct Staked;

    impl StakeProvider for Staked {
        fn satisfy_minimum_stake(&self) -> RouterResult<StakeProof> {
            Ok(StakeProof {
                stake: StakeRef::default(),
                signer: Arc::new(KeyPair::from_seed(&[5u8; 32])),
            })
        }
    }

    struct FundingWallet;

    impl Wallet for FundingWallet {
        fn build_signed_payment(&self, dest: &str, amount: Amount) -> RouterResult<String> {
            Ok(format!("{}:{}", dest, amount.0))
        }

        fn build_channel_funding(
            &self,
            _deposit_pubkey: &str,
            deposit: Amount,
            deadline: i64,
        ) -> RouterResult<PaymentChannel> {
            Ok(PaymentChannel {
                id: String::new(),
                raw_tx: "00aa".into(),
                txid: "f00d".into(),
                vout: 1,
                latest_tx: String::new(),
                value: Amount::ZERO,
                deposit,
                deadline,
                key_id: "k1".into(),
                redeem_script: "51ae".into(),
            })
        }

        fn build_channel_spend(
            &self,
            _channel: &PaymentChannel,
            _dest: &str,
            _deposit: Amount,
            cumulative: Amount,
        ) -> RouterResult<String> {
            Ok(format!("spend{}", cumulative.0))
        }

        fn release_payment(&self, _token: &str) {}
    }

    fn builder(config: NodeConfig) -> NodeBuilder {
        let network = MemoryNetwork::new();
        let (transport, _rx) = network.endpoint("node:1", 8);
        NodeBuilder::new()
            .config(config)
            .transport(Arc::new(transport))
            .registry(Arc::new(NoProviders))
            .stake(Arc::new(Staked))
            .wallet(Arc::new(FundingWallet))
    }

    #[test]
    fn test_channels_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().join("data"),
            payment: PaymentConfig {
                deposit: 1.0,
                ..PaymentConfig::default()
            },
            ..NodeConfig::default()
        };

        let node = builder(config.clone()).build().unwrap();
        node.router()
            .payments()
            .build_payment(&PaymentTarget::new("Xdest", Some("02ab")), Amount(500))
            .unwrap();
        assert!(config.channels_path().exists());
        drop(node);

        let node = builder(config).build().unwrap();
        let channel = node.router().payments().channel("Xdest").unwrap();
        assert_eq!(channel.value, Amount(500));
        assert_eq!(channel.txid, "f00d");
    }

    #[test]
    fn test_manifest_path_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.toml");
        std::fs::write(&manifest, "[main]\nchains = [\"BTC\"]\n").unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            manifest_path: Some(manifest),
            ..NodeConfig::default()
        };

        let node = builder(config).build().unwrap();
        assert_eq!(node.router().services(), vec!["meshquery".to_string()]);
        assert_eq!(node.router().status()["config"], "[main]\nchains = [\"BTC\"]\n");
    }

    #[test]
    fn test_wallet_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        };
        let err = NodeBuilder::new().config(config).build().err().unwrap();
        assert!(matches!(err, RouterError::Config(_)));
    }
}
