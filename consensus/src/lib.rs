//! MeshQuery Consensus Engine
//! 
//! Reconciles independent provider replies to one request:
//! - Replies decoded once into data or provider errors
//! - Per-request wait/notify with a hard deadline
//! - Strict majority over exact payload equality

pub mod engine;
pub mod pending;
pub mod reply;

pub use engine::*;
pub use pending::*;
pub use reply::*;
