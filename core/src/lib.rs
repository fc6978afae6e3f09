//! MeshQuery Core Library
//! 
//! Core types, traits, and abstractions for the MeshQuery service-request router.
//! This crate provides the foundation for all other MeshQuery components.

pub mod types;
pub mod traits;
pub mod error;
pub mod config;
pub mod manifest;
pub mod channel;

pub use types::*;
pub use traits::*;
pub use error::*;
pub use config::*;
pub use manifest::*;
pub use channel::*;
