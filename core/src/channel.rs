//! Payment channel record

use crate::types::Amount;
use serde::{Deserialize, Serialize};

/// An open payment channel towards one destination payment address.
///
/// `value` is the running total already promised to the destination through
/// `latest_tx`; it never exceeds `deposit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChannel {
    /// Destination payment address the channel pays into
    pub id: String,
    /// Raw funding transaction, hex
    pub raw_tx: String,
    /// Funding transaction id
    pub txid: String,
    /// Funding output index
    pub vout: u32,
    /// Latest signed spend transaction, hex; empty until the first payment
    #[serde(default)]
    pub latest_tx: String,
    /// Cumulative amount paid through this channel
    pub value: Amount,
    /// Amount locked by the funding transaction
    pub deposit: Amount,
    /// Unix time in seconds after which the channel must not be used
    pub deadline: i64,
    /// Wallet reference of the key that signs spends
    pub key_id: String,
    /// Redeem script, hex
    pub redeem_script: String,
}

impl PaymentChannel {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.deadline
    }

    /// Deposit left after `value`
    pub fn remaining(&self) -> Amount {
        Amount(self.deposit.0 - self.value.0)
    }

    /// True until the first spend has been handed out, when the funding
    /// info still has to travel with the payment token
    pub fn is_fresh(&self) -> bool {
        self.latest_tx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> PaymentChannel {
        PaymentChannel {
            id: "Xdest".into(),
            raw_tx: "00ff".into(),
            txid: "ab".repeat(32),
            vout: 0,
            latest_tx: String::new(),
            value: Amount(10),
            deposit: Amount(100),
            deadline: 1_000,
            key_id: "key-1".into(),
            redeem_script: "51".into(),
        }
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let c = channel();
        assert!(!c.is_expired(999));
        assert!(c.is_expired(1_000));
        assert_eq!(c.remaining(), Amount(90));
        assert!(c.is_fresh());
    }

    #[test]
    fn test_missing_latest_tx_defaults() {
        let json = r#"{"id":"a","raw_tx":"","txid":"t","vout":1,"value":0,
            "deposit":5,"deadline":9,"key_id":"k","redeem_script":""}"#;
        let c: PaymentChannel = serde_json::from_str(json).unwrap();
        assert!(c.latest_tx.is_empty());
        assert_eq!(c.vout, 1);
    }
}
