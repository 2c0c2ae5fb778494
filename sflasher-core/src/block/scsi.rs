use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use num_enum::{FromPrimitive, IntoPrimitive};

use super::{BlockDevice, BlockDriverFactory};
use crate::bot::{BulkOnlyTransport, CommandBlockStatus, DataStage};
use crate::config::FlashConfig;
use crate::error::{Error, Result};
use crate::usb::communication::UsbCommunication;

/// SCSI command codes
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive)]
pub enum ScsiCommand {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ReadCapacity10 = 0x25,
    Write10 = 0x2A,
}

/// Sense key of fixed format sense data
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    VendorSpecific = 0x09,
    CopyAborted = 0x0A,
    AbortedCommand = 0x0B,
    Equal = 0x0C,
    VolumeOverflow = 0x0D,
    Miscompare = 0x0E,
    #[num_enum(catch_all)]
    Reserved(u8),
}

/// ASC 0x3A: MEDIUM NOT PRESENT
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3a;

pub const REQUEST_SENSE_DATA_SIZE: usize = 18;
pub const INQUIRY_COMMAND_DATA_SIZE: usize = 36;
pub const READ_CAPACITY_DATA_SIZE: usize = 8;

/// WRITE(10) transfer length is 16 bit
const MAX_BLOCKS_PER_WRITE10: u64 = u16::MAX as u64;

/// Fixed format sense data (response code 0x70/0x71)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: SenseKey,
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
}

impl SenseData {
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < 14 {
            return None;
        }
        Some(Self {
            sense_key: SenseKey::from(data[2] & 0x0f),
            additional_sense_code: data[12],
            additional_sense_code_qualifier: data[13],
        })
    }

    pub fn is_medium_not_present(&self) -> bool {
        self.sense_key == SenseKey::NotReady && self.additional_sense_code == ASC_MEDIUM_NOT_PRESENT
    }

    /// Conditions a retry of TEST UNIT READY may clear
    pub fn is_transient(&self) -> bool {
        matches!(self.sense_key, SenseKey::NotReady | SenseKey::UnitAttention)
            && !self.is_medium_not_present()
    }

    fn into_error(self, opcode: ScsiCommand) -> Error {
        Error::CommandFailed {
            opcode: opcode.into(),
            sense_key: self.sense_key.into(),
            asc: self.additional_sense_code,
            ascq: self.additional_sense_code_qualifier,
        }
    }
}

/// INQUIRY identification strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub vendor_id: String,
    pub product_id: String,
    pub removable: bool,
}

impl InquiryData {
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < 32 {
            return None;
        }
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_string();
        Some(Self {
            vendor_id: text(&data[8..16]),
            product_id: text(&data[16..32]),
            removable: data[1] & 0x80 != 0,
        })
    }
}

/// SCSI transparent command set block device over Bulk-Only Transport
pub struct ScsiBlockDevice<C: UsbCommunication> {
    transport: BulkOnlyTransport<C>,
    ready_retries: u32,
    block_size: usize,
    block_count: u64,
    inquiry: Option<InquiryData>,
}

impl<C: UsbCommunication> ScsiBlockDevice<C> {
    pub fn new(channel: Arc<C>, interface: u8, lun: u8, ready_retries: u32) -> Self {
        Self {
            transport: BulkOnlyTransport::new(channel, interface, lun),
            ready_retries,
            block_size: 0,
            block_count: 0,
            inquiry: None,
        }
    }

    pub fn lun(&self) -> u8 {
        self.transport.lun()
    }

    /// Vendor/product strings, available after init
    pub fn inquiry(&self) -> Option<&InquiryData> {
        self.inquiry.as_ref()
    }

    async fn request_sense(&self) -> Result<SenseData> {
        let mut cdb = [0u8; 6];
        cdb[0] = ScsiCommand::RequestSense.into();
        cdb[4] = REQUEST_SENSE_DATA_SIZE as u8;
        let mut buf = [0u8; REQUEST_SENSE_DATA_SIZE];
        let csw = self
            .transport
            .execute(&cdb, DataStage::In(&mut buf))
            .await?;
        if csw.status != CommandBlockStatus::CommandPassed {
            return Err(Error::Protocol("REQUEST SENSE failed"));
        }
        SenseData::from_data(&buf).ok_or(Error::Protocol("short sense data"))
    }

    /// Fetch sense data after a failed command and map it to an error
    async fn command_error(&self, opcode: ScsiCommand) -> Error {
        match self.request_sense().await {
            Ok(sense) if sense.is_medium_not_present() => Error::MediaAbsent(self.lun()),
            Ok(sense) => sense.into_error(opcode),
            Err(e) => e,
        }
    }

    async fn inquiry_command(&self) -> Result<InquiryData> {
        let mut cdb = [0u8; 6];
        cdb[0] = ScsiCommand::Inquiry.into();
        cdb[4] = INQUIRY_COMMAND_DATA_SIZE as u8;
        let mut buf = [0u8; INQUIRY_COMMAND_DATA_SIZE];
        let csw = self
            .transport
            .execute(&cdb, DataStage::In(&mut buf))
            .await?;
        if csw.status != CommandBlockStatus::CommandPassed {
            return Err(self.command_error(ScsiCommand::Inquiry).await);
        }
        InquiryData::from_data(&buf).ok_or(Error::Protocol("short inquiry data"))
    }

    async fn wait_unit_ready(&self) -> Result<()> {
        let cdb: [u8; 6] = [ScsiCommand::TestUnitReady.into(), 0, 0, 0, 0, 0];
        let mut attempt = 0;
        loop {
            let csw = self.transport.execute(&cdb, DataStage::None).await?;
            if csw.status == CommandBlockStatus::CommandPassed {
                return Ok(());
            }
            let sense = self.request_sense().await?;
            if sense.is_medium_not_present() {
                return Err(Error::MediaAbsent(self.lun()));
            }
            attempt += 1;
            if !sense.is_transient() || attempt >= self.ready_retries {
                return Err(sense.into_error(ScsiCommand::TestUnitReady));
            }
            debug!("LUN {} not ready ({:?}), retry {}", self.lun(), sense, attempt);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn read_capacity(&self) -> Result<(u64, usize)> {
        let mut cdb = [0u8; 10];
        cdb[0] = ScsiCommand::ReadCapacity10.into();
        let mut buf = [0u8; READ_CAPACITY_DATA_SIZE];
        let csw = self
            .transport
            .execute(&cdb, DataStage::In(&mut buf))
            .await?;
        if csw.status != CommandBlockStatus::CommandPassed {
            return Err(self.command_error(ScsiCommand::ReadCapacity10).await);
        }
        let last_lba = BigEndian::read_u32(&buf[0..4]) as u64;
        let block_size = BigEndian::read_u32(&buf[4..8]) as usize;
        if block_size == 0 {
            return Err(Error::Protocol("device reported zero block size"));
        }
        Ok((last_lba + 1, block_size))
    }

    async fn write10(&self, lba: u32, blocks: u16, data: &[u8]) -> Result<()> {
        let mut cdb = [0u8; 10];
        cdb[0] = ScsiCommand::Write10.into();
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        let csw = self.transport.execute(&cdb, DataStage::Out(data)).await?;
        if csw.status != CommandBlockStatus::CommandPassed {
            return Err(self.command_error(ScsiCommand::Write10).await);
        }
        if csw.data_residue != 0 {
            warn!("WRITE(10) lba={} left {} bytes", lba, csw.data_residue);
            return Err(Error::Protocol("incomplete write"));
        }
        Ok(())
    }
}

impl<C: UsbCommunication> BlockDevice for ScsiBlockDevice<C> {
    async fn init(&mut self) -> Result<()> {
        let inquiry = self.inquiry_command().await?;
        debug!("LUN {} inquiry: {:?}", self.lun(), inquiry);
        self.inquiry = Some(inquiry);

        self.wait_unit_ready().await?;

        let (block_count, block_size) = self.read_capacity().await?;
        info!(
            "LUN {}: {} blocks of {} bytes",
            self.lun(),
            block_count,
            block_size
        );
        self.block_count = block_count;
        self.block_size = block_size;
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn write(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        if self.block_size == 0 || data.len() % self.block_size != 0 {
            return Err(Error::UnalignedBuffer {
                len: data.len(),
                block_size: self.block_size,
            });
        }
        let blocks = (data.len() / self.block_size) as u64;
        if lba + blocks > self.block_count || lba + blocks > u32::MAX as u64 + 1 {
            return Err(Error::OutOfRange { lba, blocks });
        }

        let max_bytes = MAX_BLOCKS_PER_WRITE10 as usize * self.block_size;
        let mut lba = lba;
        for part in data.chunks(max_bytes) {
            let part_blocks = (part.len() / self.block_size) as u16;
            self.write10(lba as u32, part_blocks, part).await?;
            lba += part_blocks as u64;
        }
        Ok(())
    }
}

/// Creates a [`ScsiBlockDevice`] per logical unit
#[derive(Debug, Clone, Copy)]
pub struct ScsiDriverFactory {
    pub ready_retries: u32,
}

impl From<&FlashConfig> for ScsiDriverFactory {
    fn from(config: &FlashConfig) -> Self {
        Self {
            ready_retries: config.scsi_ready_retries,
        }
    }
}

impl Default for ScsiDriverFactory {
    fn default() -> Self {
        Self::from(&FlashConfig::default())
    }
}

impl<C: UsbCommunication + 'static> BlockDriverFactory<C> for ScsiDriverFactory {
    type Device = ScsiBlockDevice<C>;

    fn create(&self, channel: Arc<C>, interface: u8, lun: u8) -> Self::Device {
        ScsiBlockDevice::new(channel, interface, lun, self.ready_retries)
    }
}
