//! Client-side channel table

use meshquery_core::PaymentChannel;
use std::collections::{BTreeMap, HashMap};

/// State to restore if the latest payment to a destination is withdrawn
#[derive(Debug)]
struct Undo {
    spend_tx: String,
    /// `None` when that payment opened the channel
    previous: Option<PaymentChannel>,
}

/// Open channels keyed by destination payment address. At most one channel
/// per destination.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: BTreeMap<String, PaymentChannel>,
    undo: HashMap<String, Undo>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted channels; a later duplicate id replaces an earlier one
    pub fn from_channels(channels: Vec<PaymentChannel>) -> Self {
        let mut table = Self::new();
        for channel in channels {
            table.insert(channel);
        }
        table
    }

    pub fn get(&self, dest: &str) -> Option<&PaymentChannel> {
        self.channels.get(dest)
    }

    pub fn get_mut(&mut self, dest: &str) -> Option<&mut PaymentChannel> {
        self.channels.get_mut(dest)
    }

    pub fn insert(&mut self, channel: PaymentChannel) -> Option<PaymentChannel> {
        self.channels.insert(channel.id.clone(), channel)
    }

    pub fn remove(&mut self, dest: &str) -> Option<PaymentChannel> {
        self.undo.remove(dest);
        self.channels.remove(dest)
    }

    /// Store `channel` after a payment, remembering `previous` so that
    /// payment can be withdrawn
    pub fn commit(&mut self, channel: PaymentChannel, previous: Option<PaymentChannel>) {
        self.undo.insert(
            channel.id.clone(),
            Undo {
                spend_tx: channel.latest_tx.clone(),
                previous,
            },
        );
        self.channels.insert(channel.id.clone(), channel);
    }

    /// Destination and prior state for the payment that produced
    /// `spend_tx`. Only the latest payment to a destination qualifies.
    pub fn take_undo(&mut self, spend_tx: &str) -> Option<(String, Option<PaymentChannel>)> {
        let dest = self
            .undo
            .iter()
            .find(|(_, u)| u.spend_tx == spend_tx)
            .map(|(dest, _)| dest.clone())?;
        let undo = self.undo.remove(&dest)?;
        let current = self.channels.get(&dest)?;
        (current.latest_tx == spend_tx).then_some((dest, undo.previous))
    }

    pub fn list(&self) -> Vec<PaymentChannel> {
        self.channels.values().cloned().collect()
    }

    /// Listing with `channel` in place of whatever its destination had
    pub fn list_with(&self, channel: &PaymentChannel) -> Vec<PaymentChannel> {
        let mut list = self.list_without(&channel.id);
        list.push(channel.clone());
        list
    }

    pub fn list_without(&self, dest: &str) -> Vec<PaymentChannel> {
        self.channels
            .values()
            .filter(|c| c.id != dest)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
