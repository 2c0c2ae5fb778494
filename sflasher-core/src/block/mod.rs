use std::sync::Arc;

use crate::error::Result;
use crate::usb::communication::UsbCommunication;

#[cfg(any(test, feature = "ramdisk"))]
pub mod ramdisk;
pub mod scsi;

#[cfg(any(test, feature = "ramdisk"))]
pub use ramdisk::RamDisk;
pub use scsi::{ScsiBlockDevice, ScsiDriverFactory};

/// Block device contract used by the flash engine
#[trait_variant::make(Send)]
pub trait BlockDevice {
    /// Bring the unit up (capacity query etc.).
    /// Returns [`crate::Error::MediaAbsent`] when the unit has no media
    async fn init(&mut self) -> Result<()>;

    /// Logical block size in bytes, > 0 once initialized
    fn block_size(&self) -> usize;

    /// Number of logical blocks, 0 when unknown
    fn block_count(&self) -> u64;

    /// Write `data` starting at block `lba`. `data.len()` must be a multiple of [`Self::block_size`]
    async fn write(&mut self, lba: u64, data: &[u8]) -> Result<()>;
}

/// Builds one block device per logical unit over a shared channel
pub trait BlockDriverFactory<C: UsbCommunication>: Send + Sync {
    type Device: BlockDevice + Send + 'static;

    fn create(&self, channel: Arc<C>, interface: u8, lun: u8) -> Self::Device;
}
