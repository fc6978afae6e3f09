//! Configuration types for MeshQuery

use crate::error::{RouterError, RouterResult};
use crate::types::Amount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Logging level
    pub log_level: String,

    /// Path of the local provider manifest, if this node serves queries
    pub manifest_path: Option<PathBuf>,

    /// Router configuration
    pub router: RouterConfig,

    /// Payment configuration
    pub payment: PaymentConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "meshquery-node".to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            manifest_path: None,
            router: RouterConfig::default(),
            payment: PaymentConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a TOML config file
    pub fn load(path: &Path) -> RouterResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn to_toml(&self) -> RouterResult<String> {
        toml::to_string_pretty(self).map_err(|e| RouterError::Serialization(e.to_string()))
    }

    /// Location of the persisted payment channels
    pub fn channels_path(&self) -> PathBuf {
        self.data_dir.join(&self.payment.channels_file)
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Master switch for outgoing queries
    pub enabled: bool,

    /// Default number of replies to wait for when the caller gives none
    pub consensus_nodes: u32,

    /// How long to wait for replies, in milliseconds
    pub wait_ms: u64,

    /// Fee ceiling per call in coins; `None` means no ceiling
    pub max_fee: Option<f64>,

    /// Per-key fee ceilings, keyed by `CHAIN::Command` or plugin name
    pub max_fee_overrides: HashMap<String, f64>,

    /// Upper bound on provider connections opened in one pass
    pub max_new_connections: usize,

    /// Minimum seconds between config requests to the same peer
    pub config_refresh_secs: u64,

    /// Minimum seconds between config requests accepted from one peer
    pub config_request_interval_secs: u64,

    /// How long reply sets are retained after their request was issued
    pub reply_retention_secs: u64,

    /// Request configs from every connected peer, not only ranked providers
    pub query_all_peers: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consensus_nodes: 1,
            wait_ms: 20_000,
            max_fee: None,
            max_fee_overrides: HashMap::new(),
            max_new_connections: 8,
            config_refresh_secs: 300,
            config_request_interval_secs: 10,
            reply_retention_secs: 600,
            query_all_peers: false,
        }
    }
}

impl RouterConfig {
    /// Fee ceiling for a rate key, falling back to the global ceiling
    pub fn max_fee_for(&self, key: &str) -> Option<Amount> {
        self.max_fee_overrides
            .get(key)
            .copied()
            .or(self.max_fee)
            .map(Amount::from_coins)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Payment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Amount in coins locked when a payment channel is opened; 0 disables channels
    pub deposit: f64,

    /// Lifetime of a new payment channel, in seconds
    pub channel_duration_secs: i64,

    /// File name of the persisted channel list, relative to the data dir
    pub channels_file: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            deposit: 0.0,
            channel_duration_secs: 24 * 60 * 60,
            channels_file: "paymentchannels.json".to_string(),
        }
    }
}

impl PaymentConfig {
    pub fn deposit_amount(&self) -> Amount {
        Amount::from_coins(self.deposit)
    }
}
