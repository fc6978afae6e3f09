//! Typed router messages
//!
//! Each message maps onto one packet command. Bodies are sequences of fields:
//!
//! - config request: `stake_tx:32 | vout:u32 | request_id | target`
//! - config reply:   `request_id | manifest_json`
//! - query:          `stake_tx:32 | vout:u32 | request_id | chain | payment | params...`
//! - reply:          `request_id | payload`

use crate::packet::{Packet, PacketError};
use meshquery_core::{Command, PacketSigner, PeerAddr, RequestId, StakeRef};

/// Wire value asking a peer for its own config
pub const SELF_TARGET: &str = "self";

/// Whose config a config request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigTarget {
    /// The receiving peer's own manifest
    SelfNode,
    /// A manifest the receiver has cached for another peer
    Peer(PeerAddr),
}

impl ConfigTarget {
    fn as_wire(&self) -> &str {
        match self {
            ConfigTarget::SelfNode => SELF_TARGET,
            ConfigTarget::Peer(addr) => addr.as_str(),
        }
    }

    fn from_wire(value: String) -> Self {
        if value == SELF_TARGET {
            ConfigTarget::SelfNode
        } else {
            ConfigTarget::Peer(PeerAddr(value))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub stake: StakeRef,
    pub request_id: RequestId,
    pub target: ConfigTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigReply {
    pub request_id: RequestId,
    pub manifest_json: String,
}

/// A query for a provider. For `CustomCall` the `chain` slot carries the
/// plugin name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub command: Command,
    pub stake: StakeRef,
    pub request_id: RequestId,
    pub chain: String,
    pub payment: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub request_id: RequestId,
    pub payload: String,
}

/// Message types for the router protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConfigRequest(ConfigRequest),
    ConfigReply(ConfigReply),
    Query(Query),
    Reply(ReplyMessage),
}

impl Message {
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::ConfigRequest(_) => "config_request",
            Message::ConfigReply(_) => "config_reply",
            Message::Query(_) => "query",
            Message::Reply(_) => "reply",
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Message::ConfigRequest(_) => Command::GetConfig,
            Message::ConfigReply(_) => Command::ConfigReply,
            Message::Query(q) => q.command,
            Message::Reply(_) => Command::Reply,
        }
    }

    /// Build the packet for this message
    pub fn to_packet(&self) -> Result<Packet, PacketError> {
        let mut packet = Packet::new(self.command());
        match self {
            Message::ConfigRequest(req) => {
                packet.append_hash(&req.stake.tx_hash);
                packet.append_u32(req.stake.vout);
                packet.append_str(req.request_id.as_str())?;
                packet.append_str(req.target.as_wire())?;
            }
            Message::ConfigReply(reply) => {
                packet.append_str(reply.request_id.as_str())?;
                packet.append_str(&reply.manifest_json)?;
            }
            Message::Query(query) => {
                if matches!(
                    query.command,
                    Command::GetConfig | Command::ConfigReply | Command::Reply
                ) {
                    return Err(PacketError::WrongCommand(query.command));
                }
                packet.append_hash(&query.stake.tx_hash);
                packet.append_u32(query.stake.vout);
                packet.append_str(query.request_id.as_str())?;
                packet.append_str(&query.chain)?;
                packet.append_str(&query.payment)?;
                for param in &query.params {
                    packet.append_str(param)?;
                }
            }
            Message::Reply(reply) => {
                packet.append_str(reply.request_id.as_str())?;
                packet.append_str(&reply.payload)?;
            }
        }
        Ok(packet)
    }

    /// Encode, signing with `signer` when given
    pub fn encode(&self, signer: Option<&dyn PacketSigner>) -> Result<Vec<u8>, PacketError> {
        let mut packet = self.to_packet()?;
        if let Some(signer) = signer {
            packet.sign(signer);
        }
        Ok(packet.to_bytes())
    }

    /// Decode the body of an authenticated packet
    pub fn from_packet(packet: &Packet) -> Result<Self, PacketError> {
        let mut reader = packet.reader();
        let message = match packet.command() {
            Command::GetConfig => {
                let tx_hash = reader.read_hash()?;
                let vout = reader.read_u32()?;
                let request_id = RequestId(reader.read_str()?);
                let target = if reader.is_empty() {
                    ConfigTarget::SelfNode
                } else {
                    ConfigTarget::from_wire(reader.read_str()?)
                };
                Message::ConfigRequest(ConfigRequest {
                    stake: StakeRef::new(tx_hash, vout),
                    request_id,
                    target,
                })
            }
            Command::ConfigReply => Message::ConfigReply(ConfigReply {
                request_id: RequestId(reader.read_str()?),
                manifest_json: reader.read_str()?,
            }),
            Command::Reply => Message::Reply(ReplyMessage {
                request_id: RequestId(reader.read_str()?),
                payload: reader.read_str()?,
            }),
            command => {
                let tx_hash = reader.read_hash()?;
                let vout = reader.read_u32()?;
                Message::Query(Query {
                    command,
                    stake: StakeRef::new(tx_hash, vout),
                    request_id: RequestId(reader.read_str()?),
                    chain: reader.read_str()?,
                    payment: reader.read_str()?,
                    params: reader.read_remaining_strs()?,
                })
            }
        };
        Ok(message)
    }

    /// Parse, authenticate and decode raw bytes from the wire
    pub fn decode(bytes: &[u8]) -> Result<(Self, Packet), PacketError> {
        let packet = Packet::from_bytes(bytes)?;
        let message = Self::from_packet(&packet)?;
        Ok((message, packet))
    }
}
