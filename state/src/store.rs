//! Channel store trait

use meshquery_core::{PaymentChannel, RouterResult};
use std::sync::Arc;

/// Storage for the full list of open payment channels
pub trait ChannelStore: Send + Sync {
    /// Read every channel that can be parsed
    fn load(&self) -> RouterResult<Vec<PaymentChannel>>;

    /// Replace the stored list with `channels`
    fn save(&self, channels: &[PaymentChannel]) -> RouterResult<()>;
}

/// Shared channel store
pub type SharedChannelStore = Arc<dyn ChannelStore>;
