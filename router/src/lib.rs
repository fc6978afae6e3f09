//! MeshQuery Router
//!
//! Routes typed queries to paid providers and reconciles their answers:
//! - Peer qualification by chain, fee ceiling and rate window
//! - Provider manifest synchronization
//! - Request/reply correlation with a bounded wait
//! - Inbound packet dispatch
//! - The `Router` query surface

pub mod cache;
pub mod correlator;
pub mod dispatcher;
pub mod handler;
pub mod rate;
pub mod router;
pub mod selection;
pub mod sync;
pub mod validation;

#[cfg(test)]
mod tests;

pub use cache::*;
pub use correlator::*;
pub use dispatcher::*;
pub use handler::*;
pub use rate::*;
pub use router::*;
pub use selection::*;
pub use sync::*;
pub use validation::*;
