//! Binary packet envelope
//!
//! ```text
//! version:u32 | command:u32 | body_len:u32 | public_key:[32] | signature:[64] | body
//! ```
//!
//! All integers are little endian. Unsigned packets carry an all-zero public
//! key and signature. A signature covers `version | command | body`.

use meshquery_core::{Command, Hash, PacketSigner, PublicKey, RouterError, Signature};
use meshquery_crypto::is_valid_signature;
use thiserror::Error;

/// Protocol version
pub const PACKET_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 4 + 4 + 4 + 32 + 64;

/// Largest body accepted from the wire
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet shorter than header ({0} bytes)")]
    ShortHeader(usize),

    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown command id {0}")]
    UnknownCommand(u32),

    #[error("body length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("invalid packet signature")]
    BadSignature,

    #[error("truncated field: {0}")]
    Truncated(&'static str),

    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    #[error("string field contains NUL")]
    EmbeddedNul,

    #[error("unexpected command {0} for this message")]
    WrongCommand(Command),
}

impl From<PacketError> for RouterError {
    fn from(err: PacketError) -> Self {
        RouterError::MalformedPacket(err.to_string())
    }
}

/// A routed packet: command, optional signature and raw body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    command: Command,
    public_key: PublicKey,
    signature: Signature,
    body: Vec<u8>,
}

impl Packet {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            public_key: PublicKey::ZERO,
            signature: Signature::ZERO,
            body: Vec::new(),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Signer's key, `None` for unsigned packets
    pub fn signer(&self) -> Option<PublicKey> {
        if self.public_key == PublicKey::ZERO {
            None
        } else {
            Some(self.public_key)
        }
    }

    pub fn append_hash(&mut self, hash: &Hash) {
        self.body.extend_from_slice(hash.as_bytes());
    }

    pub fn append_u32(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    /// Append a NUL-terminated string
    pub fn append_str(&mut self, value: &str) -> Result<(), PacketError> {
        if value.as_bytes().contains(&0) {
            return Err(PacketError::EmbeddedNul);
        }
        self.body.extend_from_slice(value.as_bytes());
        self.body.push(0);
        Ok(())
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.body.len());
        bytes.extend_from_slice(&PACKET_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.command.id().to_le_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Sign the packet; must be called after the body is complete
    pub fn sign(&mut self, signer: &dyn PacketSigner) {
        self.public_key = signer.public_key();
        self.signature = signer.sign(&self.signing_bytes());
    }

    pub fn verify(&self) -> bool {
        match self.signer() {
            Some(key) => is_valid_signature(&key, &self.signing_bytes(), &self.signature),
            None => self.signature == Signature::ZERO,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.body.len());
        bytes.extend_from_slice(&PACKET_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.command.id().to_le_bytes());
        bytes.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(self.public_key.as_bytes());
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Parse and authenticate a packet received from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::ShortHeader(bytes.len()));
        }

        let read_u32 = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };

        let version = read_u32(0);
        if version != PACKET_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let command_id = read_u32(4);
        let command = Command::from_id(command_id).ok_or(PacketError::UnknownCommand(command_id))?;
        let declared = read_u32(8) as usize;
        if declared > MAX_BODY_SIZE {
            return Err(PacketError::BodyTooLarge(declared));
        }
        let actual = bytes.len() - HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[12..44]);
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&bytes[44..108]);

        let packet = Self {
            command,
            public_key: PublicKey::from_bytes(key),
            signature: Signature::from_bytes(sig),
            body: bytes[HEADER_SIZE..].to_vec(),
        };
        if !packet.verify() {
            return Err(PacketError::BadSignature);
        }
        Ok(packet)
    }

    pub fn reader(&self) -> BodyReader<'_> {
        BodyReader::new(&self.body)
    }
}

/// Sequential reader over a packet body
pub struct BodyReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn read_hash(&mut self) -> Result<Hash, PacketError> {
        let end = self.offset + 32;
        if end > self.data.len() {
            return Err(PacketError::Truncated("hash"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&self.data[self.offset..end]);
        self.offset = end;
        Ok(Hash::from_bytes(arr))
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        let end = self.offset + 4;
        if end > self.data.len() {
            return Err(PacketError::Truncated("u32"));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.offset..end]);
        self.offset = end;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_str(&mut self) -> Result<String, PacketError> {
        let rest = &self.data[self.offset.min(self.data.len())..];
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(PacketError::Truncated("string"))?;
        let value = std::str::from_utf8(&rest[..len]).map_err(|_| PacketError::InvalidUtf8)?;
        self.offset += len + 1;
        Ok(value.to_string())
    }

    /// Read strings until the body is exhausted
    pub fn read_remaining_strs(&mut self) -> Result<Vec<String>, PacketError> {
        let mut out = Vec::new();
        while !self.is_empty() {
            out.push(self.read_str()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshquery_crypto::KeyPair;

    fn sample() -> Packet {
        let mut packet = Packet::new(Command::GetBlock);
        packet.append_hash(&Hash::from_bytes([9u8; 32]));
        packet.append_u32(3);
        packet.append_str("BTC").unwrap();
        packet
    }

    #[test]
    fn test_signed_packet_decodes() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let mut packet = sample();
        packet.sign(&keypair);

        let decoded = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(decoded.signer(), Some(keypair.public_key()));

        let mut reader = decoded.reader();
        assert_eq!(reader.read_hash().unwrap(), Hash::from_bytes([9u8; 32]));
        assert_eq!(reader.read_u32().unwrap(), 3);
        assert_eq!(reader.read_str().unwrap(), "BTC");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let mut packet = sample();
        packet.sign(&keypair);

        let mut bytes = packet.to_bytes();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        assert_eq!(Packet::from_bytes(&bytes), Err(PacketError::BadSignature));
    }

    #[test]
    fn test_header_checks() {
        let bytes = sample().to_bytes();

        assert!(matches!(
            Packet::from_bytes(&bytes[..50]),
            Err(PacketError::ShortHeader(50))
        ));
        assert!(matches!(
            Packet::from_bytes(&bytes[..bytes.len() - 1]),
            Err(PacketError::LengthMismatch { .. })
        ));

        let mut wrong_version = bytes.clone();
        wrong_version[0] = 2;
        assert_eq!(
            Packet::from_bytes(&wrong_version),
            Err(PacketError::UnsupportedVersion(2))
        );

        let mut wrong_command = bytes;
        wrong_command[4] = 99;
        assert_eq!(
            Packet::from_bytes(&wrong_command),
            Err(PacketError::UnknownCommand(99))
        );
    }

    #[test]
    fn test_string_fields() {
        let mut packet = Packet::new(Command::Reply);
        assert_eq!(packet.append_str("a\0b"), Err(PacketError::EmbeddedNul));
        packet.append_str("").unwrap();
        packet.append_str("x").unwrap();

        let mut reader = packet.reader();
        assert_eq!(reader.read_remaining_strs().unwrap(), vec!["", "x"]);

        let mut truncated = BodyReader::new(b"abc");
        assert_eq!(truncated.read_str(), Err(PacketError::Truncated("string")));
    }
}
