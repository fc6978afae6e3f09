//! In-memory channel store

use meshquery_core::{PaymentChannel, RouterError, RouterResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::store::ChannelStore;

/// Keeps the saved list in memory; used by tests and by nodes running
/// without a data directory
#[derive(Default)]
pub struct MemoryChannelStore {
    channels: RwLock<Vec<PaymentChannel>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Vec<PaymentChannel>) -> Self {
        Self {
            channels: RwLock::new(channels),
            ..Self::default()
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<PaymentChannel> {
        self.channels.read().clone()
    }

    /// Make subsequent saves fail, simulating a full disk
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl ChannelStore for MemoryChannelStore {
    fn load(&self) -> RouterResult<Vec<PaymentChannel>> {
        Ok(self.channels.read().clone())
    }

    fn save(&self, channels: &[PaymentChannel]) -> RouterResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(RouterError::Storage("memory store refuses writes".into()));
        }
        *self.channels.write() = channels.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
