//! Provider replies

use meshquery_core::{ErrorReply, PeerAddr, RequestId, RouterError};

/// A provider's answer, decoded once when it arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Anything that is not a structured error
    Data(String),
    /// JSON object carrying an integer `code`
    ProviderError {
        code: i32,
        message: String,
        raw: String,
    },
}

impl Reply {
    pub fn decode(payload: &str) -> Self {
        let value = match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(serde_json::Value::Object(obj)) => obj,
            _ => return Reply::Data(payload.to_string()),
        };
        let Some(code) = value
            .get("code")
            .and_then(|c| c.as_i64())
            .and_then(|c| i32::try_from(c).ok())
        else {
            return Reply::Data(payload.to_string());
        };
        let message = value
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string();
        Reply::ProviderError {
            code,
            message,
            raw: payload.to_string(),
        }
    }

    /// The payload exactly as received; consensus compares these
    pub fn raw(&self) -> &str {
        match self {
            Reply::Data(data) => data,
            Reply::ProviderError { raw, .. } => raw,
        }
    }

    /// Provider says the payment channel we paid through has expired
    pub fn is_expired_channel(&self) -> bool {
        matches!(self, Reply::ProviderError { code, .. }
            if *code == RouterError::ExpiredPaymentChannel.code())
    }

    /// Convert into the caller-facing result for request `id`
    pub fn into_result(self, id: &RequestId) -> Result<String, ErrorReply> {
        match self {
            Reply::Data(data) => Ok(data),
            Reply::ProviderError { code, message, .. } => Err(ErrorReply {
                error: message,
                code,
                uuid: id.to_string(),
            }),
        }
    }
}

/// Replies collected for one request, one per peer, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplySet {
    entries: Vec<(PeerAddr, Reply)>,
}

impl ReplySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `reply` from `peer`. A repeated peer overwrites its earlier
    /// reply in place. Returns true if the peer is new to this set.
    pub fn insert(&mut self, peer: PeerAddr, reply: Reply) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(p, _)| *p == peer) {
            entry.1 = reply;
            return false;
        }
        self.entries.push((peer, reply));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, peer: &PeerAddr) -> Option<&Reply> {
        self.entries.iter().find(|(p, _)| p == peer).map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PeerAddr, Reply)> {
        self.entries.iter()
    }

    /// `{"replies":[{"node":..., "reply":...}], "uuid":...}` listing
    pub fn to_json(&self, id: &RequestId) -> String {
        let replies: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|(peer, reply)| {
                serde_json::json!({ "node": peer.as_str(), "reply": reply.raw() })
            })
            .collect();
        serde_json::json!({ "replies": replies, "uuid": id.as_str() }).to_string()
    }
}
