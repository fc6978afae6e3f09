//! MeshQuery Cryptography Module
//! 
//! Ed25519 keys used to sign and verify router packets.

pub mod keys;
pub mod signing;

pub use keys::*;
pub use signing::*;
