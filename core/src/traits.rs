//! Collaborator interfaces consumed by the router
//!
//! The router never owns connections, wallets or the provider registry. It
//! talks to them through these traits so that nodes can plug in their own
//! implementations and tests can plug in fakes.

use crate::channel::PaymentChannel;
use crate::error::RouterResult;
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

/// Transport tag under which all router packets travel
pub const CHANNEL_TAG: &str = "meshquery";

/// Peer-to-peer transport and peer table
#[async_trait]
pub trait Transport: Send + Sync {
    /// Addresses of currently connected peers
    fn connected_peers(&self) -> Vec<PeerAddr>;

    /// Open (or reuse) a connection; `None` when the peer is unreachable
    async fn connect(&self, addr: &PeerAddr) -> Option<PeerAddr>;

    /// Queue `bytes` for delivery to `peer` under `tag`
    async fn send(&self, peer: &PeerAddr, tag: &str, bytes: Vec<u8>) -> RouterResult<()>;

    /// Report protocol misbehaviour; the transport decides whether to ban
    fn penalize(&self, peer: &PeerAddr, score: u32, reason: &str);

    fn is_connected(&self, peer: &PeerAddr) -> bool {
        self.connected_peers().iter().any(|p| p == peer)
    }
}

/// Entry of the ranked provider list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub address: PeerAddr,
    pub services: Vec<String>,
    /// Address that receives this provider's fees
    pub payment_address: String,
    pub pubkey: String,
}

impl ProviderInfo {
    pub fn has_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

/// Provider ranking and discovery
pub trait ProviderRegistry: Send + Sync {
    /// Current providers ordered by rank
    fn ranked_providers(&self) -> Vec<(u32, ProviderInfo)>;

    fn find(&self, addr: &PeerAddr) -> Option<ProviderInfo> {
        self.ranked_providers()
            .into_iter()
            .map(|(_, info)| info)
            .find(|info| &info.address == addr)
    }
}

/// Signs outgoing packets
pub trait PacketSigner: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, message: &[u8]) -> Signature;
}

/// Proof that the sender holds the minimum stake, plus the key that signs
/// packets on its behalf
#[derive(Clone)]
pub struct StakeProof {
    pub stake: StakeRef,
    pub signer: Arc<dyn PacketSigner>,
}

impl std::fmt::Debug for StakeProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StakeProof")
            .field("stake", &self.stake)
            .field("signer", &self.signer.public_key())
            .finish()
    }
}

/// Minimum stake requirement
pub trait StakeProvider: Send + Sync {
    /// Fails with `InsufficientFunds` when no stake output is spendable
    fn satisfy_minimum_stake(&self) -> RouterResult<StakeProof>;
}

/// Wallet-side transaction construction
pub trait Wallet: Send + Sync {
    /// Signed single-use payment of `amount` to `dest`, raw hex
    fn build_signed_payment(&self, dest: &str, amount: Amount) -> RouterResult<String>;

    /// Fund a new channel locking `deposit` for `deposit_pubkey` until `deadline`
    fn build_channel_funding(
        &self,
        deposit_pubkey: &str,
        deposit: Amount,
        deadline: i64,
    ) -> RouterResult<PaymentChannel>;

    /// Signed spend moving `cumulative` of the channel to `dest`, raw hex
    fn build_channel_spend(
        &self,
        channel: &PaymentChannel,
        dest: &str,
        deposit: Amount,
        cumulative: Amount,
    ) -> RouterResult<String>;

    /// Unlock the outputs reserved by a payment token that will not be sent
    fn release_payment(&self, token: &str);
}

/// On-chain domain registration checks
pub trait DomainVerifier: Send + Sync {
    /// Height of the block confirming `tx` as a registration of `domain`
    /// owned by `payment_address`, or `None` if it does not verify
    fn verify_domain(&self, tx: &str, domain: &str, payment_address: &str) -> Option<u64>;
}
