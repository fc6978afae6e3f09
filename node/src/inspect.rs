//! Offline inspection used by the binary's subcommands

use meshquery_core::{NodeConfig, ProviderConfig, RouterResult, CHANNEL_TAG};
use meshquery_state::{ChannelStore, JsonChannelStore};
use std::path::Path;
use tracing::info;

/// Config from `path`, or defaults when no file is given
pub fn load_config(path: Option<&Path>) -> RouterResult<NodeConfig> {
    match path {
        Some(path) => {
            let config = NodeConfig::load(path)?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(NodeConfig::default()),
    }
}

/// Persisted payment channels as of unix time `now`
pub fn channel_report(config: &NodeConfig, now: i64) -> RouterResult<serde_json::Value> {
    let store = JsonChannelStore::new(config.channels_path());
    let channels: Vec<serde_json::Value> = store
        .load()?
        .into_iter()
        .map(|c| {
            serde_json::json!({
                "node_id": c.id,
                "deposit_txid": c.txid,
                "paid": c.value.0,
                "deposit": c.deposit.0,
                "remaining": c.deposit.0 - c.value.0,
                "expired": now >= c.deadline,
            })
        })
        .collect();
    Ok(serde_json::json!({
        "file": config.channels_path().display().to_string(),
        "channels": channels,
    }))
}

/// What a provider running the manifest at `path` would advertise
pub fn manifest_report(path: &Path) -> RouterResult<serde_json::Value> {
    let config = ProviderConfig::load(path)?;
    let main = config.manifest.main();
    let plugins: serde_json::Map<String, serde_json::Value> = config
        .plugins
        .iter()
        .map(|(name, p)| {
            (
                name.clone(),
                serde_json::json!({
                    "fee": p.fee,
                    "min_params": p.min_params,
                    "max_params": p.max_params,
                    "timeout": p.timeout,
                }),
            )
        })
        .collect();
    Ok(serde_json::json!({
        "chains": main.chains,
        "fee": main.fee,
        "timeout": main.timeout,
        "domain": config.manifest.domain(),
        "channels": config.manifest.deposit_pubkey().is_some(),
        "plugins": plugins,
        "services": config.service_tags(CHANNEL_TAG),
    }))
}
