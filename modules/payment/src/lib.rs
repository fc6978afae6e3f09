//! MeshQuery Payment Module
//! 
//! Pays providers per call with:
//! - Fee lookup from provider manifests
//! - Single-use payment transactions
//! - Incrementally topped-up payment channels
//! - Durable channel state

pub mod token;
pub mod channel;
pub mod engine;

pub use token::*;
pub use channel::*;
pub use engine::*;
