use log::trace;

use super::BlockDevice;
use crate::error::{Error, Result};

/// Block device backed by RAM
pub struct RamDisk<const LOGICAL_BLOCK_SIZE: usize> {
    /// Storage on RAM
    data: Vec<u8>,
    /// LUN reported in MediaAbsent
    lun: u8,
    /// false: init reports MediaAbsent
    media_present: bool,
    /// Number of write requests served
    write_count: usize,
}

impl<const LOGICAL_BLOCK_SIZE: usize> RamDisk<LOGICAL_BLOCK_SIZE> {
    /// Create a new zero filled RamDisk
    pub fn new(num_blocks: usize) -> Self {
        Self {
            data: vec![0; num_blocks * LOGICAL_BLOCK_SIZE],
            lun: 0,
            media_present: true,
            write_count: 0,
        }
    }

    /// RamDisk with no media, init fails with MediaAbsent
    pub fn without_media(lun: u8) -> Self {
        Self {
            data: Vec::new(),
            lun,
            media_present: false,
            write_count: 0,
        }
    }

    /// Set data to RamDisk
    pub fn set_data(&mut self, offset_bytes: usize, data: &[u8]) {
        self.data[offset_bytes..offset_bytes + data.len()].copy_from_slice(data);
    }

    /// Get data from RamDisk
    pub fn get_data(&self, offset_bytes: usize, len: usize) -> &[u8] {
        &self.data[offset_bytes..offset_bytes + len]
    }

    pub fn write_count(&self) -> usize {
        self.write_count
    }
}

impl<const LOGICAL_BLOCK_SIZE: usize> BlockDevice for RamDisk<LOGICAL_BLOCK_SIZE> {
    async fn init(&mut self) -> Result<()> {
        if self.media_present {
            Ok(())
        } else {
            Err(Error::MediaAbsent(self.lun))
        }
    }

    fn block_size(&self) -> usize {
        LOGICAL_BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / LOGICAL_BLOCK_SIZE) as u64
    }

    async fn write(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        if data.len() % LOGICAL_BLOCK_SIZE != 0 {
            return Err(Error::UnalignedBuffer {
                len: data.len(),
                block_size: LOGICAL_BLOCK_SIZE,
            });
        }
        let ram_offset_start = lba as usize * LOGICAL_BLOCK_SIZE;
        let ram_offset_end = ram_offset_start + data.len();

        // out of range
        if ram_offset_end > self.data.len() {
            return Err(Error::OutOfRange {
                lba,
                blocks: (data.len() / LOGICAL_BLOCK_SIZE) as u64,
            });
        }
        trace!("ramdisk write lba={} len={}", lba, data.len());
        self.data[ram_offset_start..ram_offset_end].copy_from_slice(data);
        self.write_count += 1;
        Ok(())
    }
}
