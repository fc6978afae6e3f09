//! MeshQuery State Management
//! 
//! Durable storage for client-side payment channels. The whole channel list
//! is written on every change and read back once at startup.

pub mod store;
pub mod memory;
pub mod persistent;

pub use store::*;
pub use memory::*;
pub use persistent::*;
