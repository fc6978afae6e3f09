//! Payment engine
//!
//! Turns a provider fee into a payment token. Providers that publish a
//! deposit key are paid through a payment channel when this node has a
//! deposit configured; everyone else gets a single-use transaction.

use meshquery_core::{
    unix_now, Amount, Command, PaymentChannel, PaymentConfig, ProviderConfig, RouterError,
    RouterResult, Wallet,
};
use meshquery_state::SharedChannelStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::ChannelTable;
use crate::token::{ChannelFunding, PaymentToken};

/// Where a payment goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTarget {
    /// Provider's fee address
    pub address: String,
    /// Deposit key advertised in the provider's manifest
    pub deposit_pubkey: Option<String>,
}

impl PaymentTarget {
    pub fn new(address: impl Into<String>, deposit_pubkey: Option<&str>) -> Self {
        Self {
            address: address.into(),
            deposit_pubkey: deposit_pubkey.map(str::to_string),
        }
    }
}

/// Fee charged by a provider for `command` on `chain`
pub fn command_fee(config: &ProviderConfig, command: Command, chain: &str) -> Amount {
    config.manifest.command_fee(command, chain)
}

/// Fee charged by a provider for one call of plugin `name`
pub fn plugin_fee(config: &ProviderConfig, name: &str) -> Option<Amount> {
    config.plugin(name).map(|p| p.fee())
}

pub struct PaymentEngine {
    wallet: Arc<dyn Wallet>,
    store: SharedChannelStore,
    channels: Mutex<ChannelTable>,
    deposit: Amount,
    channel_duration_secs: i64,
}

impl PaymentEngine {
    /// Create the engine and reload persisted channels
    pub fn new(
        config: &PaymentConfig,
        wallet: Arc<dyn Wallet>,
        store: SharedChannelStore,
    ) -> RouterResult<Self> {
        let channels = store.load()?;
        if !channels.is_empty() {
            info!("Restored {} payment channels", channels.len());
        }
        Ok(Self {
            wallet,
            store,
            channels: Mutex::new(ChannelTable::from_channels(channels)),
            deposit: config.deposit_amount(),
            channel_duration_secs: config.channel_duration_secs,
        })
    }

    pub fn uses_channels_for(&self, target: &PaymentTarget) -> bool {
        self.deposit.0 > 0 && target.deposit_pubkey.is_some()
    }

    pub fn build_payment(&self, target: &PaymentTarget, fee: Amount) -> RouterResult<PaymentToken> {
        self.build_payment_at(target, fee, unix_now())
    }

    /// Build a payment as of unix time `now`
    pub fn build_payment_at(
        &self,
        target: &PaymentTarget,
        fee: Amount,
        now: i64,
    ) -> RouterResult<PaymentToken> {
        if fee.is_free() {
            return Ok(PaymentToken::NoFee);
        }
        if target.address.is_empty() {
            return Err(RouterError::InsufficientFunds(
                "provider has no payment address".into(),
            ));
        }

        let token = match target.deposit_pubkey.as_deref() {
            Some(pubkey) if self.deposit.0 > 0 => self.pay_through_channel(target, pubkey, fee, now)?,
            _ => {
                let raw = self
                    .wallet
                    .build_signed_payment(&target.address, fee)
                    .map_err(|e| insufficient("payment transaction", e))?;
                PaymentToken::Single(raw)
            }
        };
        debug!("Payment of {} to {}: {}", fee, target.address, token);
        Ok(token)
    }

    fn pay_through_channel(
        &self,
        target: &PaymentTarget,
        deposit_pubkey: &str,
        fee: Amount,
        now: i64,
    ) -> RouterResult<PaymentToken> {
        let dest = target.address.as_str();
        let mut channels = self.channels.lock();

        let stale = channels.get(dest).and_then(|c| {
            if c.is_expired(now) {
                Some("expired")
            } else if c.value.saturating_add(fee) > c.deposit {
                Some("used up")
            } else {
                None
            }
        });
        if let Some(reason) = stale {
            self.store.save(&channels.list_without(dest))?;
            if let Some(old) = channels.remove(dest) {
                info!("Payment channel {} to {} is {}", old.txid, dest, reason);
            }
        }

        // Work on a copy; the table only changes once the store has it
        let previous = channels.get(dest).cloned();
        let (mut candidate, funding) = match &previous {
            Some(channel) => (channel.clone(), None),
            None => {
                let channel = self.open_channel(dest, deposit_pubkey, fee, now)?;
                let funding = ChannelFunding {
                    raw_tx: channel.raw_tx.clone(),
                    txid: channel.txid.clone(),
                    redeem_script: channel.redeem_script.clone(),
                };
                (channel, Some(funding))
            }
        };

        let cumulative = candidate.value.saturating_add(fee);
        let spent = self
            .wallet
            .build_channel_spend(&candidate, dest, candidate.deposit, cumulative)
            .map_err(|e| insufficient("channel payment", e))
            .and_then(|spend_tx| {
                candidate.latest_tx = spend_tx.clone();
                candidate.value = cumulative;
                self.store.save(&channels.list_with(&candidate))?;
                Ok(spend_tx)
            });
        let spend_tx = match spent {
            Ok(spend_tx) => spend_tx,
            Err(e) => {
                if let Some(funding) = funding {
                    let unsent = PaymentToken::Channel {
                        funding: Some(funding),
                        spend_tx: String::new(),
                    };
                    self.wallet.release_payment(&unsent.to_wire());
                }
                return Err(e);
            }
        };

        if funding.is_some() {
            info!("Opened payment channel {} to {}", candidate.txid, dest);
        }
        channels.commit(candidate, previous);
        Ok(PaymentToken::Channel { funding, spend_tx })
    }

    /// Fund a new, empty channel to `dest` able to carry `fee`
    fn open_channel(
        &self,
        dest: &str,
        deposit_pubkey: &str,
        fee: Amount,
        now: i64,
    ) -> RouterResult<PaymentChannel> {
        if fee > self.deposit {
            return Err(RouterError::InsufficientFunds(format!(
                "fee {} exceeds channel deposit {}",
                fee, self.deposit
            )));
        }
        let deadline = now + self.channel_duration_secs;
        let mut channel = self
            .wallet
            .build_channel_funding(deposit_pubkey, self.deposit, deadline)
            .map_err(|e| insufficient("payment channel", e))?;
        if channel.txid.is_empty() {
            return Err(RouterError::InsufficientFunds(
                "payment channel funding has no txid".into(),
            ));
        }
        channel.id = dest.to_string();
        channel.deadline = deadline;
        channel.deposit = self.deposit;
        channel.value = Amount::ZERO;
        channel.latest_tx.clear();
        Ok(channel)
    }

    /// A provider rejected our channel to `dest` as expired: forget it so
    /// the next payment opens a fresh one
    pub fn revalidate_on_expiry(&self, dest: &str) -> RouterResult<bool> {
        let mut channels = self.channels.lock();
        let Some(old) = channels.remove(dest) else {
            return Ok(false);
        };
        warn!("Provider {} rejected payment channel {}", dest, old.txid);
        self.store.save(&channels.list())?;
        Ok(true)
    }

    /// Withdraw a token that was never sent: the channel it was drawn on
    /// goes back to its prior state and the wallet unlocks its outputs
    pub fn release(&self, token: &PaymentToken) {
        if token.is_free() {
            return;
        }
        if let PaymentToken::Channel { spend_tx, .. } = token {
            self.roll_back(spend_tx);
        }
        self.wallet.release_payment(&token.to_wire());
    }

    fn roll_back(&self, spend_tx: &str) {
        let mut channels = self.channels.lock();
        let Some((dest, previous)) = channels.take_undo(spend_tx) else {
            debug!("No channel to roll back for spend {}", spend_tx);
            return;
        };
        let restored = match &previous {
            Some(channel) => channels.list_with(channel),
            None => channels.list_without(&dest),
        };
        if let Err(e) = self.store.save(&restored) {
            warn!("Failed to roll back payment channel to {}: {}", dest, e);
            return;
        }
        match previous {
            Some(channel) => {
                debug!("Payment channel to {} back at {}", dest, channel.value);
                channels.insert(channel);
            }
            None => {
                info!("Dropped undelivered payment channel to {}", dest);
                channels.remove(&dest);
            }
        }
    }

    pub fn channel(&self, dest: &str) -> Option<PaymentChannel> {
        self.channels.lock().get(dest).cloned()
    }

    pub fn channels(&self) -> Vec<PaymentChannel> {
        self.channels.lock().list()
    }

    /// Human readable listing of open channels
    pub fn print_channels(&self, now: i64) -> serde_json::Value {
        let list: Vec<serde_json::Value> = self
            .channels()
            .into_iter()
            .map(|c| {
                serde_json::json!({
                    "node_id": c.id,
                    "deposit_tx": c.raw_tx,
                    "deposit_txid": c.txid,
                    "redeem_tx": c.latest_tx,
                    "paid": c.value.0,
                    "deposit": c.deposit.0,
                    "expires_in_secs": c.deadline - now,
                })
            })
            .collect();
        serde_json::json!({ "client": list })
    }
}

fn insufficient(what: &str, err: RouterError) -> RouterError {
    warn!("Failed to create {}: {}", what, err);
    match err {
        RouterError::InsufficientFunds(_) => err,
        other => RouterError::InsufficientFunds(format!("{}: {}", what, other)),
    }
}
