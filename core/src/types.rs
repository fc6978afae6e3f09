//! Core types for MeshQuery
//!
//! Defines fundamental data structures used across the system.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable address-string key of a network peer (e.g. `"10.0.0.1:41412"`).
///
/// The transport owns the actual connection; the router only ever refers to
/// peers through this key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr(pub String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerAddr(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerAddr {
    fn from(s: &str) -> Self {
        PeerAddr(s.to_string())
    }
}

impl From<String> for PeerAddr {
    fn from(s: String) -> Self {
        PeerAddr(s)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({})", self.0)
    }
}

/// Identifier shared by every packet of one logical query.
///
/// Locally generated ids are uuid v4 strings. Ids received from the wire are
/// kept verbatim so that replies to ids we never issued can still be stored.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a fresh random request id
    pub fn generate() -> Self {
        RequestId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// 32-byte hash type
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(0x{})", self.to_hex())
    }
}

/// 64-byte signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub const ZERO: Signature = Signature([0u8; 64]);

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Signature(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}...)", &self.to_hex()[..16])
    }
}

/// 32-byte public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub const ZERO: PublicKey = PublicKey([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{})", self.to_hex())
    }
}

/// Fee or payment amount in base units (1 coin = 10^8 units).
///
/// Signed on purpose: providers may advertise zero or negative fees, and any
/// amount `<= 0` means the call is free.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Amount(pub i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const COIN: i64 = 100_000_000;

    pub fn new(value: i64) -> Self {
        Amount(value)
    }

    /// Convert a decimal coin value as written in manifests
    pub fn from_coins(coins: f64) -> Self {
        Amount((coins * Self::COIN as f64).round() as i64)
    }

    pub fn is_free(&self) -> bool {
        self.0 <= 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let coin = Self::COIN as u64;
        write!(f, "{}{}.{:08}", sign, abs / coin, abs % coin)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

/// Current wall clock time in unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Router commands as carried in the packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Command {
    GetBlockCount = 1,
    GetBlockHash = 2,
    GetBlock = 3,
    GetTransaction = 4,
    GetAllBlocks = 5,
    GetAllTransactions = 6,
    GetBalance = 7,
    GetBalanceUpdate = 8,
    GetTransactionsBloomFilter = 9,
    SendTransaction = 10,
    TimeToBlockNumber = 11,
    CustomCall = 12,
    GetConfig = 20,
    ConfigReply = 21,
    Reply = 30,
}

impl Command {
    pub const QUERIES: [Command; 11] = [
        Command::GetBlockCount,
        Command::GetBlockHash,
        Command::GetBlock,
        Command::GetTransaction,
        Command::GetAllBlocks,
        Command::GetAllTransactions,
        Command::GetBalance,
        Command::GetBalanceUpdate,
        Command::GetTransactionsBloomFilter,
        Command::SendTransaction,
        Command::TimeToBlockNumber,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        let cmd = match id {
            1 => Command::GetBlockCount,
            2 => Command::GetBlockHash,
            3 => Command::GetBlock,
            4 => Command::GetTransaction,
            5 => Command::GetAllBlocks,
            6 => Command::GetAllTransactions,
            7 => Command::GetBalance,
            8 => Command::GetBalanceUpdate,
            9 => Command::GetTransactionsBloomFilter,
            10 => Command::SendTransaction,
            11 => Command::TimeToBlockNumber,
            12 => Command::CustomCall,
            20 => Command::GetConfig,
            21 => Command::ConfigReply,
            30 => Command::Reply,
            _ => return None,
        };
        Some(cmd)
    }

    /// Name used in manifests and rate-limit keys
    pub fn name(self) -> &'static str {
        match self {
            Command::GetBlockCount => "GetBlockCount",
            Command::GetBlockHash => "GetBlockHash",
            Command::GetBlock => "GetBlock",
            Command::GetTransaction => "GetTransaction",
            Command::GetAllBlocks => "GetAllBlocks",
            Command::GetAllTransactions => "GetAllTransactions",
            Command::GetBalance => "GetBalance",
            Command::GetBalanceUpdate => "GetBalanceUpdate",
            Command::GetTransactionsBloomFilter => "GetTransactionsBloomFilter",
            Command::SendTransaction => "SendTransaction",
            Command::TimeToBlockNumber => "TimeToBlockNumber",
            Command::CustomCall => "CustomCall",
            Command::GetConfig => "GetConfig",
            Command::ConfigReply => "ConfigReply",
            Command::Reply => "Reply",
        }
    }

    /// Key under which calls of this command on `chain` are rate limited
    pub fn rate_key(self, chain: &str) -> String {
        format!("{}::{}", chain, self.name())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to the unspent output proving the sender holds the minimum stake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StakeRef {
    pub tx_hash: Hash,
    pub vout: u32,
}

impl StakeRef {
    pub fn new(tx_hash: Hash, vout: u32) -> Self {
        Self { tx_hash, vout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_roundtrip() {
        for cmd in Command::QUERIES {
            assert_eq!(Command::from_id(cmd.id()), Some(cmd));
        }
        assert_eq!(Command::from_id(0), None);
        assert_eq!(Command::from_id(99), None);
    }

    #[test]
    fn test_amount_from_coins() {
        assert_eq!(Amount::from_coins(0.5).0, 50_000_000);
        assert_eq!(Amount::from_coins(0.00000001).0, 1);
        assert!(Amount::from_coins(0.0).is_free());
        assert!(Amount::from_coins(-1.0).is_free());
        assert_eq!(Amount::from_coins(1.25).to_string(), "1.25000000");
    }

    #[test]
    fn test_rate_key() {
        assert_eq!(Command::GetBlock.rate_key("BTC"), "BTC::GetBlock");
    }

    #[test]
    fn test_request_ids_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
