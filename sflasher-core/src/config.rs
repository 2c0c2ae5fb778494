use std::time::Duration;

use serde::Deserialize;

/// Reference transfer chunk: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Flash Configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Bytes read from the image and written to the device per iteration
    pub chunk_size: usize,
    /// Timeout for a single control or bulk transfer in milliseconds
    pub transfer_timeout_ms: u64,
    /// TEST UNIT READY attempts before a logical unit is declared not ready
    pub scsi_ready_retries: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            transfer_timeout_ms: 5000,
            scsi_ready_retries: 3,
        }
    }
}

impl FlashConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}
