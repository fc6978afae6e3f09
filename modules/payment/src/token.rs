//! Payment tokens attached to outgoing queries
//!
//! Wire forms:
//! - `nofee`
//! - `single;<raw_tx>`
//! - `channel;<raw_funding_tx>;<funding_txid>;<redeem_script>;<spend_tx>` for
//!   the first payment through a channel
//! - `channel;<spend_tx>` afterwards

use meshquery_core::{RouterError, RouterResult};
use std::fmt;

pub const NO_FEE: &str = "nofee";
const SINGLE_PREFIX: &str = "single;";
const CHANNEL_PREFIX: &str = "channel;";

/// Funding details sent once, with the first spend of a new channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFunding {
    pub raw_tx: String,
    pub txid: String,
    pub redeem_script: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentToken {
    NoFee,
    Single(String),
    Channel {
        funding: Option<ChannelFunding>,
        spend_tx: String,
    },
}

impl PaymentToken {
    pub fn is_free(&self) -> bool {
        matches!(self, PaymentToken::NoFee)
    }

    pub fn to_wire(&self) -> String {
        match self {
            PaymentToken::NoFee => NO_FEE.to_string(),
            PaymentToken::Single(raw) => format!("{}{}", SINGLE_PREFIX, raw),
            PaymentToken::Channel { funding: None, spend_tx } => {
                format!("{}{}", CHANNEL_PREFIX, spend_tx)
            }
            PaymentToken::Channel {
                funding: Some(f),
                spend_tx,
            } => format!(
                "{}{};{};{};{}",
                CHANNEL_PREFIX, f.raw_tx, f.txid, f.redeem_script, spend_tx
            ),
        }
    }

    pub fn parse(wire: &str) -> RouterResult<Self> {
        if wire == NO_FEE {
            return Ok(PaymentToken::NoFee);
        }
        if let Some(raw) = wire.strip_prefix(SINGLE_PREFIX) {
            return Ok(PaymentToken::Single(raw.to_string()));
        }
        if let Some(rest) = wire.strip_prefix(CHANNEL_PREFIX) {
            let parts: Vec<&str> = rest.split(';').collect();
            return match parts.as_slice() {
                [spend] => Ok(PaymentToken::Channel {
                    funding: None,
                    spend_tx: spend.to_string(),
                }),
                [raw_tx, txid, redeem, spend] => Ok(PaymentToken::Channel {
                    funding: Some(ChannelFunding {
                        raw_tx: raw_tx.to_string(),
                        txid: txid.to_string(),
                        redeem_script: redeem.to_string(),
                    }),
                    spend_tx: spend.to_string(),
                }),
                _ => Err(RouterError::BadRequest(format!(
                    "malformed channel payment with {} fields",
                    parts.len()
                ))),
            };
        }
        Err(RouterError::BadRequest("unknown payment token".into()))
    }
}

impl fmt::Display for PaymentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
