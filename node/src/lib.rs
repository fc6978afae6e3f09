//! MeshQuery Node
//!
//! Assembles a router from a `NodeConfig`:
//! - Payment channels persisted under the data directory
//! - Local provider manifest, if configured
//! - Offline inspection of configs, channels and manifests

mod inspect;
mod node;

pub use inspect::*;
pub use node::*;
