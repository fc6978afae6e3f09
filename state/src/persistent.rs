//! Channel store backed by a JSON file

use meshquery_core::{PaymentChannel, RouterError, RouterResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::store::ChannelStore;

/// Stores channels as a JSON array in a single file.
///
/// Saves go through a sibling temp file and a rename so a crash mid-write
/// leaves the previous list intact.
pub struct JsonChannelStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonChannelStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ChannelStore for JsonChannelStore {
    fn load(&self) -> RouterResult<Vec<PaymentChannel>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let text = std::fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring unreadable channel file {}: {}", self.path.display(), e);
                return Ok(Vec::new());
            }
        };
        let serde_json::Value::Array(entries) = value else {
            warn!("Channel file {} is not a list", self.path.display());
            return Ok(Vec::new());
        };

        let mut channels = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<PaymentChannel>(entry) {
                Ok(channel) => channels.push(channel),
                Err(e) => warn!("Skipping channel entry {}: {}", index, e),
            }
        }
        debug!("Loaded {} payment channels", channels.len());
        Ok(channels)
    }

    fn save(&self, channels: &[PaymentChannel]) -> RouterResult<()> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let text = serde_json::to_string_pretty(channels)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            RouterError::Storage(format!("replace {}: {}", self.path.display(), e))
        })?;
        debug!("Saved {} payment channels", channels.len());
        Ok(())
    }
}
