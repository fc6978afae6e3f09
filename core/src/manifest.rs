//! Provider manifests
//!
//! A provider advertises what it serves through a TOML manifest plus one TOML
//! document per plugin. Both travel verbatim inside config replies, so the raw
//! text is kept next to the parsed form.

use crate::error::{RouterError, RouterResult};
use crate::types::{Amount, Command};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// `[main]` section of a provider manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MainSection {
    pub chains: Vec<String>,
    pub fee: f64,
    pub timeout: f64,
    pub domain: Option<String>,
    pub domain_tx: Option<String>,
    pub deposit_pubkey: Option<String>,
    /// Plugins to load from the `plugins/` directory next to the manifest
    pub plugins: Vec<String>,
}

/// Per-command override, keyed `Command` or `CHAIN::Command`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSection {
    pub fee: Option<f64>,
    pub timeout: Option<f64>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ManifestDoc {
    main: MainSection,
    commands: HashMap<String, CommandSection>,
}

/// Parsed provider manifest together with its source text
#[derive(Debug, Clone, Default)]
pub struct ProviderManifest {
    raw: String,
    main: MainSection,
    commands: HashMap<String, CommandSection>,
}

impl ProviderManifest {
    pub fn parse(raw: &str) -> RouterResult<Self> {
        let doc: ManifestDoc = toml::from_str(raw)?;
        Ok(Self {
            raw: raw.to_string(),
            main: doc.main,
            commands: doc.commands,
        })
    }

    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    pub fn main(&self) -> &MainSection {
        &self.main
    }

    pub fn supports_chain(&self, chain: &str) -> bool {
        self.main.chains.iter().any(|c| c == chain)
    }

    fn section(&self, command: Command, chain: &str) -> impl Iterator<Item = &CommandSection> {
        let specific = self.commands.get(&command.rate_key(chain));
        let generic = self.commands.get(command.name());
        specific.into_iter().chain(generic)
    }

    /// A command is available when its chain is listed and no matching
    /// section disables it
    pub fn is_available(&self, command: Command, chain: &str) -> bool {
        self.supports_chain(chain) && !self.section(command, chain).any(|s| s.disabled)
    }

    pub fn command_fee(&self, command: Command, chain: &str) -> Amount {
        let coins = self
            .section(command, chain)
            .find_map(|s| s.fee)
            .unwrap_or(self.main.fee);
        Amount::from_coins(coins)
    }

    /// Minimum interval between two calls of `command` from one client
    pub fn command_timeout(&self, command: Command, chain: &str) -> Duration {
        let secs = self
            .section(command, chain)
            .find_map(|s| s.timeout)
            .unwrap_or(self.main.timeout);
        secs_to_duration(secs)
    }

    pub fn domain(&self) -> Option<&str> {
        self.main.domain.as_deref().filter(|d| !d.is_empty())
    }

    pub fn domain_tx(&self) -> Option<&str> {
        self.main.domain_tx.as_deref().filter(|t| !t.is_empty())
    }

    /// Key the provider accepts channel deposits for, if it takes channels
    pub fn deposit_pubkey(&self) -> Option<&str> {
        self.main.deposit_pubkey.as_deref().filter(|k| !k.is_empty())
    }
}

/// Settings of one provider plugin
#[derive(Debug, Clone, Default)]
pub struct PluginSettings {
    raw: String,
    pub fee: f64,
    pub min_params: usize,
    pub max_params: usize,
    pub timeout: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PluginDoc {
    fee: f64,
    min_params: usize,
    max_params: usize,
    timeout: f64,
}

impl PluginSettings {
    pub fn parse(raw: &str) -> RouterResult<Self> {
        let doc: PluginDoc = toml::from_str(raw)?;
        if doc.min_params > doc.max_params {
            return Err(RouterError::Config(format!(
                "plugin min_params {} exceeds max_params {}",
                doc.min_params, doc.max_params
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            fee: doc.fee,
            min_params: doc.min_params,
            max_params: doc.max_params,
            timeout: doc.timeout,
        })
    }

    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    pub fn fee(&self) -> Amount {
        Amount::from_coins(self.fee)
    }

    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout)
    }

    pub fn accepts_param_count(&self, count: usize) -> RouterResult<()> {
        if count < self.min_params {
            return Err(RouterError::InvalidParameters(
                "Not enough plugin parameters".to_string(),
            ));
        }
        if count > self.max_params {
            return Err(RouterError::InvalidParameters(
                "Too many plugin parameters".to_string(),
            ));
        }
        Ok(())
    }
}

/// Non-positive and NaN become zero; values too large for a `Duration`
/// saturate
fn secs_to_duration(secs: f64) -> Duration {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Everything a provider advertises: its manifest and its plugins.
///
/// Peers' configs are replaced wholesale on every config reply, never edited.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub manifest: ProviderManifest,
    pub plugins: BTreeMap<String, PluginSettings>,
}

/// JSON document carried in a config reply
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEnvelope {
    config: String,
    #[serde(default)]
    plugins: BTreeMap<String, String>,
    #[serde(default)]
    addr: String,
}

impl ProviderConfig {
    pub fn new(manifest: ProviderManifest) -> Self {
        Self {
            manifest,
            plugins: BTreeMap::new(),
        }
    }

    /// Load a manifest file and the plugins it lists from `plugins/<name>.toml`
    pub fn load(path: &Path) -> RouterResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::new(ProviderManifest::parse(&raw)?);

        let plugin_dir = path
            .parent()
            .map(|p| p.join("plugins"))
            .unwrap_or_else(|| Path::new("plugins").to_path_buf());
        for name in config.manifest.main().plugins.clone() {
            let text = std::fs::read_to_string(plugin_dir.join(format!("{}.toml", name)))
                .map_err(|e| RouterError::Config(format!("plugin {}: {}", name, e)))?;
            config.add_plugin(name, PluginSettings::parse(&text)?);
        }
        Ok(config)
    }

    pub fn add_plugin(&mut self, name: impl Into<String>, settings: PluginSettings) {
        self.plugins.insert(name.into(), settings);
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginSettings> {
        self.plugins.get(name)
    }

    /// Serialize as the `{config, plugins, addr}` document of a config reply
    pub fn to_reply_json(&self, addr: &str) -> RouterResult<String> {
        let envelope = ManifestEnvelope {
            config: self.manifest.raw_text().to_string(),
            plugins: self
                .plugins
                .iter()
                .map(|(name, p)| (name.clone(), p.raw_text().to_string()))
                .collect(),
            addr: addr.to_string(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse a config reply document; returns the config and its `addr` field
    pub fn from_reply_json(json: &str) -> RouterResult<(Self, String)> {
        let envelope: ManifestEnvelope = serde_json::from_str(json)?;
        let mut config = Self::new(ProviderManifest::parse(&envelope.config)?);
        for (name, text) in envelope.plugins {
            let settings = PluginSettings::parse(&text)?;
            config.add_plugin(name, settings);
        }
        Ok((config, envelope.addr))
    }

    /// Service tags a provider running this config announces
    pub fn service_tags(&self, base: &str) -> Vec<String> {
        let mut tags = vec![base.to_string()];
        tags.extend(self.plugins.keys().map(|name| format!("{}::{}", base, name)));
        tags
    }
}
