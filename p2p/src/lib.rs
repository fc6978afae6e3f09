//! MeshQuery P2P Layer
//! 
//! Provides the router's wire format and an in-process transport:
//! - Binary packet envelope with ed25519 signatures
//! - Typed config/query/reply messages
//! - `MemoryNetwork` for local harnesses and tests

pub mod network;
pub mod packet;
pub mod message;
pub mod peer;

pub use network::*;
pub use packet::*;
pub use message::*;
pub use peer::*;
