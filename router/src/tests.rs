//! End-to-end router tests over an in-process network
//!
//! Each test wires one client router and a handful of provider routers to a
//! `MemoryNetwork`. Providers answer through scripted handlers.

use crate::{DispatchOutcome, ProviderHandler, Router};
use async_trait::async_trait;
use meshquery_core::{
    Amount, Command, DomainVerifier, PaymentChannel, PaymentConfig, PeerAddr, PluginSettings,
    ProviderConfig, ProviderInfo, ProviderManifest, ProviderRegistry, RequestId, RouterConfig,
    RouterError, RouterResult, StakeProof, StakeProvider, StakeRef, Transport, Wallet,
    CHANNEL_TAG,
};
use meshquery_crypto::KeyPair;
use meshquery_p2p::{
    ConfigRequest, ConfigTarget, InboundPacket, MemoryNetwork, Message, Query,
};
use meshquery_payment::{PaymentEngine, PaymentToken};
use meshquery_state::MemoryChannelStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BTC: &str = "[main]\nchains = [\"BTC\"]\n";

struct Ranking(Vec<ProviderInfo>);

impl ProviderRegistry for Ranking {
    fn ranked_providers(&self) -> Vec<(u32, ProviderInfo)> {
        self.0
            .iter()
            .cloned()
            .enumerate()
            .map(|(rank, info)| (rank as u32, info))
            .collect()
    }
}

struct Staked;

impl StakeProvider for Staked {
    fn satisfy_minimum_stake(&self) -> RouterResult<StakeProof> {
        Ok(StakeProof {
            stake: StakeRef::default(),
            signer: Arc::new(KeyPair::from_seed(&[3u8; 32])),
        })
    }
}

#[derive(Default)]
struct TestWallet {
    /// Refuse payments once this many were built
    fail_after: Option<usize>,
    payments: Mutex<usize>,
    fundings: Mutex<usize>,
    released: Mutex<Vec<String>>,
}

impl Wallet for TestWallet {
    fn build_signed_payment(&self, dest: &str, amount: Amount) -> RouterResult<String> {
        let mut built = self.payments.lock();
        if self.fail_after.is_some_and(|limit| *built >= limit) {
            return Err(RouterError::InsufficientFunds("wallet is locked".into()));
        }
        *built += 1;
        Ok(format!("pay-{}-{}", dest, amount.0))
    }

    fn build_channel_funding(
        &self,
        _deposit_pubkey: &str,
        deposit: Amount,
        deadline: i64,
    ) -> RouterResult<PaymentChannel> {
        let mut fundings = self.fundings.lock();
        *fundings += 1;
        Ok(PaymentChannel {
            id: String::new(),
            raw_tx: "fundraw".into(),
            txid: format!("fund{}", fundings),
            vout: 0,
            latest_tx: String::new(),
            value: Amount::ZERO,
            deposit,
            deadline,
            key_id: String::new(),
            redeem_script: "redeem".into(),
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

    fn release_payment(&self, token: &str) {
        self.released.lock().push(token.to_string());
    }
}

/// Accepts registrations written as `block-<height>`
struct BlockVerifier;

impl DomainVerifier for BlockVerifier {
    fn verify_domain(&self, tx: &str, _domain: &str, _payment_address: &str) -> Option<u64> {
        tx.strip_prefix("block-")?.parse().ok()
    }
}

/// Answers every query with a fixed payload and records what it saw
#[derive(Default)]
struct Scripted {
    answer: Option<String>,
    seen: Mutex<Vec<Query>>,
}

#[async_trait]
impl ProviderHandler for Scripted {
    async fn handle_query(&self, _from: &PeerAddr, query: &Query) -> Option<String> {
        self.seen.lock().push(query.clone());
        if query.command == Command::CustomCall {
            return Some(format!("{}:{}", query.chain, query.params.join(",")));
        }
        self.answer.clone()
    }

    async fn process_custom_call(&self, name: &str, params: &[String]) -> RouterResult<String> {
        Ok(format!("local {}({})", name, params.join(",")))
    }
}

struct ProviderSetup {
    manifest: String,
    plugins: Vec<(&'static str, &'static str)>,
    answer: Option<String>,
}

fn provider(manifest: &str, answer: Option<&str>) -> ProviderSetup {
    ProviderSetup {
        manifest: manifest.to_string(),
        plugins: Vec::new(),
        answer: answer.map(str::to_string),
    }
}

impl ProviderSetup {
    fn plugin(mut self, name: &'static str, settings: &'static str) -> Self {
        self.plugins.push((name, settings));
        self
    }

    fn config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new(ProviderManifest::parse(&self.manifest).unwrap());
        for (name, settings) in &self.plugins {
            config.add_plugin(*name, PluginSettings::parse(settings).unwrap());
        }
        config
    }
}

struct Options {
    config: RouterConfig,
    payment: PaymentConfig,
    wallet: TestWallet,
    verifier: Option<Arc<dyn DomainVerifier>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: RouterConfig {
                wait_ms: 1000,
                ..RouterConfig::default()
            },
            payment: PaymentConfig::default(),
            wallet: TestWallet::default(),
            verifier: None,
        }
    }
}

struct Mesh {
    network: Arc<MemoryNetwork>,
    client: Arc<Router>,
    wallet: Arc<TestWallet>,
    handlers: Vec<Arc<Scripted>>,
}

fn engine(config: &PaymentConfig, wallet: Arc<TestWallet>) -> Arc<PaymentEngine> {
    Arc::new(PaymentEngine::new(config, wallet, Arc::new(MemoryChannelStore::new())).unwrap())
}

fn provider_router(
    network: &Arc<MemoryNetwork>,
    addr: &str,
    config: ProviderConfig,
    handler: Arc<Scripted>,
) -> Arc<Router> {
    let (transport, rx) = network.endpoint(addr, 32);
    let router = Router::builder()
        .transport(Arc::new(transport))
        .registry(Arc::new(Ranking(Vec::new())))
        .stake(Arc::new(Staked))
        .payments(engine(&PaymentConfig::default(), Arc::default()))
        .handler(handler)
        .local_config(config)
        .build()
        .unwrap();
    let router = Arc::new(router);
    router.spawn(rx);
    router
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Providers `p:<i>` paid at `Xpay<i>`, and a client that has fetched all
/// their configs when the router is enabled
async fn mesh(setups: Vec<ProviderSetup>, options: Options) -> Mesh {
    let network = MemoryNetwork::new();
    let mut infos = Vec::new();
    let mut handlers = Vec::new();

    for (i, setup) in setups.iter().enumerate() {
        let addr = format!("p:{}", i);
        let config = setup.config();
        infos.push(ProviderInfo {
            address: PeerAddr::from(addr.as_str()),
            services: config.service_tags(CHANNEL_TAG),
            payment_address: format!("Xpay{}", i),
            pubkey: String::new(),
        });
        let handler = Arc::new(Scripted {
            answer: setup.answer.clone(),
            ..Scripted::default()
        });
        provider_router(&network, &addr, config, handler.clone());
        handlers.push(handler);
    }

    let wallet = Arc::new(options.wallet);
    let (transport, rx) = network.endpoint("client:1", 32);
    let mut builder = Router::builder()
        .config(options.config)
        .transport(Arc::new(transport))
        .registry(Arc::new(Ranking(infos)))
        .stake(Arc::new(Staked))
        .payments(engine(&options.payment, wallet.clone()));
    if let Some(verifier) = options.verifier {
        builder = builder.verifier(verifier);
    }
    let client = Arc::new(builder.build().unwrap());
    client.spawn(rx);

    if client.is_enabled() {
        client.open_connections(None).await;
        let expected = setups.len();
        eventually(|| client.cache().len() == expected).await;
    }

    Mesh {
        network,
        client,
        wallet,
        handlers,
    }
}

#[tokio::test]
async fn test_majority_answer_wins_and_scores_follow() {
    let m = mesh(
        vec![
            provider(BTC, Some("812")),
            provider(BTC, Some("812")),
            provider(BTC, Some("811")),
        ],
        Options {
            config: RouterConfig {
                consensus_nodes: 3,
                ..Options::default().config
            },
            ..Options::default()
        },
    )
    .await;

    assert_eq!(m.client.get_block_count("BTC", None).await.unwrap(), "812");
    assert_eq!(m.client.scores().score(&"p:0".into()), 1);
    assert_eq!(m.client.scores().score(&"p:1".into()), 1);
    assert_eq!(m.client.scores().score(&"p:2".into()), -1);

    let query = m.handlers[0].seen.lock()[0].clone();
    assert_eq!(query.command, Command::GetBlockCount);
    assert_eq!(query.payment, "nofee");
    assert!(query.params.is_empty());
}

#[tokio::test]
async fn test_split_answers_are_internal_error() {
    let m = mesh(
        vec![
            provider(BTC, Some("1")),
            provider(BTC, Some("2")),
            provider(BTC, Some("3")),
        ],
        Options::default(),
    )
    .await;

    let err = m.client.get_block_hash("BTC", "7", Some(3)).await.unwrap_err();
    assert_eq!(err.code, 1002);
    assert!(!err.uuid.is_empty());
    assert_eq!(m.handlers[1].seen.lock()[0].params, vec!["7".to_string()]);
}

#[tokio::test]
async fn test_silent_providers_time_out_and_late_replies_are_kept() {
    let m = mesh(
        vec![provider(BTC, Some("42")), provider(BTC, None)],
        Options {
            config: RouterConfig {
                consensus_nodes: 2,
                wait_ms: 150,
                ..RouterConfig::default()
            },
            ..Options::default()
        },
    )
    .await;

    let started = Instant::now();
    let err = m.client.get_block_count("BTC", None).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(err.code, 1003);

    let replies = m.client.get_reply(&err.uuid).unwrap();
    assert!(replies.contains("42"));

    let missing = m.client.get_reply("no-such-request").unwrap_err();
    assert_eq!(missing.error, "No replies found");
    assert_eq!(missing.code, 1004);
}

#[tokio::test]
async fn test_rate_window_blocks_repeat_query() {
    let m = mesh(
        vec![provider(
            "[main]\nchains = [\"BTC\"]\ntimeout = 30.0\n",
            Some("5"),
        )],
        Options::default(),
    )
    .await;

    assert_eq!(m.client.get_block_count("BTC", None).await.unwrap(), "5");
    let err = m.client.get_block_count("BTC", None).await.unwrap_err();
    assert_eq!(err.code, 1029);
    assert_eq!(m.handlers[0].seen.lock().len(), 1);
}

#[tokio::test]
async fn test_selection_errors_surface_as_codes() {
    let m = mesh(
        vec![provider("[main]\nchains = [\"BTC\"]\nfee = 0.5\n", Some("1"))],
        Options {
            config: RouterConfig {
                max_fee: Some(0.1),
                ..Options::default().config
            },
            ..Options::default()
        },
    )
    .await;

    let err = m.client.get_block_count("LTC", None).await.unwrap_err();
    assert_eq!(err.code, 1027);
    let err = m.client.get_block_count("BTC", None).await.unwrap_err();
    assert_eq!(err.code, 1030);
    let err = m.client.get_block_hash("BTC", "abc", None).await.unwrap_err();
    assert_eq!(err.code, 1025);
    assert!(m.handlers[0].seen.lock().is_empty());
}

#[tokio::test]
async fn test_disabled_router_refuses_everything() {
    let m = mesh(
        vec![provider(BTC, Some("1"))],
        Options {
            config: RouterConfig {
                enabled: false,
                ..RouterConfig::default()
            },
            ..Options::default()
        },
    )
    .await;

    let err = m.client.get_block_count("BTC", None).await.unwrap_err();
    assert_eq!(err.code, 1001);
    assert!(err.uuid.is_empty());
    let err = m
        .client
        .send_custom_call("echo", &["x".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.code, 1001);

    let outcome = m
        .client
        .handle_packet(InboundPacket {
            from: "p:0".into(),
            tag: CHANNEL_TAG.into(),
            bytes: vec![1, 2, 3],
        })
        .await;
    assert_eq!(outcome, DispatchOutcome::Ignored);
}

#[tokio::test]
async fn test_channel_funding_is_sent_once() {
    let m = mesh(
        vec![provider(
            "[main]\nchains = [\"BTC\"]\nfee = 0.01\ndeposit_pubkey = \"02ab\"\n",
            Some("9"),
        )],
        Options {
            payment: PaymentConfig {
                deposit: 1.0,
                ..PaymentConfig::default()
            },
            ..Options::default()
        },
    )
    .await;

    m.client.get_block_count("BTC", None).await.unwrap();
    m.client.get_block_count("BTC", None).await.unwrap();

    assert_eq!(*m.wallet.fundings.lock(), 1);
    let fee = Amount::from_coins(0.01);
    let channel = m.client.payments().channel("Xpay0").unwrap();
    assert_eq!(channel.value, Amount(fee.0 * 2));

    let seen = m.handlers[0].seen.lock();
    match PaymentToken::parse(&seen[0].payment).unwrap() {
        PaymentToken::Channel { funding, .. } => assert_eq!(funding.unwrap().txid, "fund1"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        PaymentToken::parse(&seen[1].payment).unwrap(),
        PaymentToken::Channel {
            funding: None,
            spend_tx: format!("spend{}", fee.0 * 2),
        }
    );
}

#[tokio::test]
async fn test_expired_channel_reply_drops_channel() {
    let expired = RouterError::ExpiredPaymentChannel.into_reply("").to_json();
    let m = mesh(
        vec![provider(
            "[main]\nchains = [\"BTC\"]\nfee = 0.01\ndeposit_pubkey = \"02ab\"\n",
            Some(expired.as_str()),
        )],
        Options {
            payment: PaymentConfig {
                deposit: 1.0,
                ..PaymentConfig::default()
            },
            ..Options::default()
        },
    )
    .await;

    let err = m.client.get_block_count("BTC", None).await.unwrap_err();
    assert_eq!(err.code, 1031);
    assert!(!err.uuid.is_empty());
    assert!(m.client.payments().channel("Xpay0").is_none());
}

#[tokio::test]
async fn test_unpayable_round_releases_built_payments() {
    let priced = "[main]\nchains = [\"BTC\"]\nfee = 0.01\n";
    let m = mesh(
        vec![provider(priced, Some("1")), provider(priced, Some("1"))],
        Options {
            wallet: TestWallet {
                fail_after: Some(1),
                ..TestWallet::default()
            },
            ..Options::default()
        },
    )
    .await;

    let err = m.client.get_block_count("BTC", Some(2)).await.unwrap_err();
    assert_eq!(err.code, 1026);

    let released = m.wallet.released.lock();
    assert_eq!(released.len(), 1);
    assert!(released[0].starts_with("single;pay-Xpay"));
    assert!(m.handlers.iter().all(|h| h.seen.lock().is_empty()));
}

#[tokio::test]
async fn test_unpayable_round_drops_unused_channel() {
    let m = mesh(
        vec![
            provider(
                "[main]\nchains = [\"BTC\"]\nfee = 0.01\ndeposit_pubkey = \"02ab\"\n",
                Some("1"),
            ),
            provider("[main]\nchains = [\"BTC\"]\nfee = 0.01\n", Some("1")),
        ],
        Options {
            payment: PaymentConfig {
                deposit: 1.0,
                ..PaymentConfig::default()
            },
            wallet: TestWallet {
                fail_after: Some(0),
                ..TestWallet::default()
            },
            ..Options::default()
        },
    )
    .await;

    let err = m.client.get_block_count("BTC", Some(2)).await.unwrap_err();
    assert_eq!(err.code, 1026);
    assert!(m.client.payments().channel("Xpay0").is_none());
    {
        let released = m.wallet.released.lock();
        assert_eq!(released.len(), 1);
        assert!(released[0].starts_with("channel;fundraw;fund1;redeem;"));
    }

    // The next channel payment announces its funding again
    assert_eq!(m.client.get_block_count("BTC", Some(1)).await.unwrap(), "1");
    let seen = m.handlers[0].seen.lock();
    match PaymentToken::parse(&seen[0].payment).unwrap() {
        PaymentToken::Channel { funding, .. } => assert_eq!(funding.unwrap().txid, "fund2"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_call_reaches_plugin_provider() {
    let m = mesh(
        vec![
            provider(BTC, Some("1")),
            provider("[main]\nchains = [\"BTC\"]\ndomain = \"tools\"\n", None)
                .plugin("echo", "min_params = 1\nmax_params = 2\n"),
        ],
        Options::default(),
    )
    .await;

    let answer = m
        .client
        .send_custom_call("echo", &["hi".to_string()])
        .await
        .unwrap();
    assert_eq!(answer, "echo:hi");

    let answer = m
        .client
        .send_custom_call("tools/echo", &["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(answer, "echo:a,b");
    assert!(m.handlers[1]
        .seen
        .lock()
        .iter()
        .all(|q| q.command == Command::CustomCall && q.chain == "echo"));

    let too_many: Vec<String> = vec!["1".into(), "2".into(), "3".into()];
    let err = m.client.send_custom_call("echo", &too_many).await.unwrap_err();
    assert_eq!(err.code, 1025);

    let err = m.client.send_custom_call("nope", &[]).await.unwrap_err();
    assert_eq!(err.code, 1028);
    assert!(m.handlers[0].seen.lock().is_empty());
}

#[tokio::test]
async fn test_local_plugin_runs_without_network() {
    let network = MemoryNetwork::new();
    let mut config = ProviderConfig::new(ProviderManifest::parse(BTC).unwrap());
    config.add_plugin("echo", PluginSettings::parse("max_params = 2\n").unwrap());
    let router = provider_router(&network, "self:1", config, Arc::default());

    let answer = router
        .send_custom_call("echo", &["x".to_string()])
        .await
        .unwrap();
    assert_eq!(answer, "local echo(x)");
    assert_eq!(
        router.services(),
        vec!["meshquery".to_string(), "meshquery::echo".to_string()]
    );
}

#[tokio::test]
async fn test_config_requests_are_rate_limited() {
    let network = MemoryNetwork::new();
    let router = provider_router(
        &network,
        "p:0",
        ProviderConfig::new(ProviderManifest::parse(BTC).unwrap()),
        Arc::default(),
    );
    let (raw, mut raw_rx) = network.endpoint("raw:1", 8);
    raw.connect(&"p:0".into()).await.unwrap();

    let request = |id: &str, target: ConfigTarget| InboundPacket {
        from: "raw:1".into(),
        tag: CHANNEL_TAG.into(),
        bytes: Message::ConfigRequest(ConfigRequest {
            stake: StakeRef::default(),
            request_id: RequestId::from(id),
            target,
        })
        .encode(None)
        .unwrap(),
    };

    let outcome = router
        .handle_packet(request("c1", ConfigTarget::SelfNode))
        .await;
    assert_eq!(outcome, DispatchOutcome::ConfigServed(RequestId::from("c1")));
    let packet = raw_rx.recv().await.unwrap();
    match Message::decode(&packet.bytes).unwrap().0 {
        Message::ConfigReply(reply) => {
            let (config, addr) = ProviderConfig::from_reply_json(&reply.manifest_json).unwrap();
            assert_eq!(addr, "self");
            assert!(config.manifest.supports_chain("BTC"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let outcome = router
        .handle_packet(request("c2", ConfigTarget::SelfNode))
        .await;
    assert_eq!(outcome, DispatchOutcome::ConfigRateLimited);
    assert!(raw.is_connected(&"p:0".into()));

    let (other, _other_rx) = network.endpoint("raw:2", 8);
    other.connect(&"p:0".into()).await.unwrap();
    let mut unknown = request("c3", ConfigTarget::Peer("r:9".into()));
    unknown.from = "raw:2".into();
    assert_eq!(
        router.handle_packet(unknown).await,
        DispatchOutcome::ConfigUnavailable
    );
}

#[tokio::test]
async fn test_garbage_packets_get_sender_banned() {
    let network = MemoryNetwork::new();
    let router = provider_router(
        &network,
        "p:0",
        ProviderConfig::new(ProviderManifest::parse(BTC).unwrap()),
        Arc::default(),
    );
    let (raw, _raw_rx) = network.endpoint("raw:1", 8);
    raw.connect(&"p:0".into()).await.unwrap();

    let garbage = || InboundPacket {
        from: "raw:1".into(),
        tag: CHANNEL_TAG.into(),
        bytes: vec![0xff; 7],
    };
    let foreign = InboundPacket {
        tag: "chat".into(),
        ..garbage()
    };
    assert_eq!(router.handle_packet(foreign).await, DispatchOutcome::Ignored);

    for _ in 0..9 {
        let outcome = router.handle_packet(garbage()).await;
        assert!(matches!(outcome, DispatchOutcome::Rejected(_)));
    }
    assert!(raw.is_connected(&"p:0".into()));
    router.handle_packet(garbage()).await;
    assert!(!raw.is_connected(&"p:0".into()));
}

#[tokio::test]
async fn test_status_reports_cached_providers() {
    let manifest = "[main]\nchains = [\"BTC\"]\ndomain = \"blocks\"\ndomain_tx = \"block-7\"\n";
    let m = mesh(
        vec![provider(manifest, Some("1")).plugin("echo", "max_params = 1\n")],
        Options {
            verifier: Some(Arc::new(BlockVerifier)),
            ..Options::default()
        },
    )
    .await;

    let status = m.client.status();
    assert_eq!(status["enabled"], true);
    assert_eq!(status["config"], "");
    assert_eq!(status["nodes"][0]["node"], "p:0");
    assert_eq!(status["nodes"][0]["config"], manifest);
    assert_eq!(status["nodes"][0]["plugins"]["echo"], "max_params = 1\n");
    assert_eq!(m.client.print_configs()[0]["config"], manifest);
    assert_eq!(
        m.client.print_payment_channels(),
        serde_json::json!({ "client": [] })
    );
    assert_eq!(m.client.services(), vec!["meshquery".to_string()]);

    assert!(m.client.query_domain("blocks").await);
    assert!(!m.client.query_domain("nowhere").await);

    m.network.remove(&"p:0".into());
    assert!(!m.client.query_domain("blocks").await);
}

#[tokio::test]
async fn test_manifest_reload_picks_up_new_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.toml");
    std::fs::write(&path, BTC).unwrap();

    let network = MemoryNetwork::new();
    let (transport, _rx) = network.endpoint("p:0", 8);
    let router = Router::builder()
        .transport(Arc::new(transport))
        .registry(Arc::new(Ranking(Vec::new())))
        .stake(Arc::new(Staked))
        .payments(engine(&PaymentConfig::default(), Arc::default()))
        .manifest_path(&path)
        .build()
        .unwrap();
    assert_eq!(router.services(), vec!["meshquery".to_string()]);

    std::fs::create_dir(dir.path().join("plugins")).unwrap();
    std::fs::write(dir.path().join("plugins/echo.toml"), "max_params = 1\n").unwrap();
    std::fs::write(&path, format!("{}plugins = [\"echo\"]\n", BTC)).unwrap();
    router.reload_manifest().unwrap();
    assert!(router.services().contains(&"meshquery::echo".to_string()));

    std::fs::write(&path, "[main\n").unwrap();
    assert!(router.reload_manifest().is_err());
    assert!(router.services().contains(&"meshquery::echo".to_string()));
}

#[test]
fn test_builder_requires_collaborators() {
    let err = Router::builder().build().err().unwrap();
    assert!(matches!(err, RouterError::Config(_)));
}
