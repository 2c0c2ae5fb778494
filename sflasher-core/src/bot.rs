//! Bulk-Only Transport: command block wrapper out, optional data stage, command status wrapper in.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::usb::communication::{ControlSetup, TransferError, UsbCommunication};
use crate::usb::descriptor::EndpointDirection;

pub const CBW_LENGTH: usize = 31;
pub const CSW_LENGTH: usize = 13;

/// Bulk Transport wrapper signatures
#[repr(u32)]
#[derive(Debug, Copy, Clone)]
enum BulkTransportSignature {
    CommandBlockWrapper = 0x43425355,
    CommandStatusWrapper = 0x53425355,
}

/// Data stage direction, CBWFlags bit 7
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataDirection {
    HostToDevice,
    DeviceToHost,
}

/// Bulk Transport command status
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommandBlockStatus {
    CommandPassed,
    CommandFailed,
    PhaseError,
    Reserved { value: u8 },
}

/// Bulk Transport command block wrapper packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CommandBlockWrapperPacket {
    /// Signature: 0x43425355
    pub signature: u32,
    /// Tag: echoed back by the device in the CSW
    pub tag: u32,
    /// Data Transfer Length: bytes expected in the data stage
    pub data_transfer_length: u32,
    /// Flags: Bit7=Data In (bulk-in=1, bulk-out=0)
    pub flags: u8,
    /// LUN: Logical Unit Number
    pub lun: u8,
    /// Command Length: valid bytes of `command`
    pub command_length: u8,
    /// Command: SCSI Command Block
    pub command: [u8; 16],
}

impl CommandBlockWrapperPacket {
    pub fn new(
        tag: u32,
        lun: u8,
        command: &[u8],
        data_transfer_length: u32,
        direction: DataDirection,
    ) -> Self {
        let command_length = command.len().min(16);
        let mut cb = [0u8; 16];
        cb[..command_length].copy_from_slice(&command[..command_length]);
        Self {
            signature: BulkTransportSignature::CommandBlockWrapper as u32,
            tag,
            data_transfer_length,
            flags: match direction {
                DataDirection::HostToDevice => 0x00,
                DataDirection::DeviceToHost => 0x80,
            },
            lun,
            command_length: command_length as u8,
            command: cb,
        }
    }

    /// Parse from a 31 byte buffer
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < CBW_LENGTH {
            return None;
        }
        let mut command = [0u8; 16];
        command.copy_from_slice(&data[15..31]);
        Some(Self {
            signature: LittleEndian::read_u32(&data[0..4]),
            tag: LittleEndian::read_u32(&data[4..8]),
            data_transfer_length: LittleEndian::read_u32(&data[8..12]),
            flags: data[12],
            lun: data[13],
            command_length: data[14],
            command,
        })
    }

    pub fn is_valid_signature(&self) -> bool {
        self.signature == (BulkTransportSignature::CommandBlockWrapper as u32)
    }

    /// Convert to byte array
    pub fn to_data(&self) -> [u8; CBW_LENGTH] {
        let mut data = [0; CBW_LENGTH];
        LittleEndian::write_u32(&mut data[0..4], self.signature);
        LittleEndian::write_u32(&mut data[4..8], self.tag);
        LittleEndian::write_u32(&mut data[8..12], self.data_transfer_length);
        data[12] = self.flags;
        data[13] = self.lun;
        data[14] = self.command_length;
        data[15..31].copy_from_slice(&self.command);
        data
    }

    pub fn data_direction(&self) -> DataDirection {
        if self.flags & 0x80 == 0 {
            DataDirection::HostToDevice
        } else {
            DataDirection::DeviceToHost
        }
    }

    /// get command block
    pub fn commands(&self) -> &[u8] {
        &self.command[..(self.command_length as usize).min(16)]
    }
}

/// Bulk Transport command status wrapper packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CommandStatusWrapperPacket {
    /// Signature: 0x53425355
    pub signature: u32,
    /// Tag: copied from the CBW
    pub tag: u32,
    /// Data Residue: Amount of data not transferred
    pub data_residue: u32,
    /// Status: Command status
    pub status: CommandBlockStatus,
}

impl CommandStatusWrapperPacket {
    pub fn new(tag: u32, data_residue: u32, status: CommandBlockStatus) -> Self {
        Self {
            signature: BulkTransportSignature::CommandStatusWrapper as u32,
            tag,
            data_residue,
            status,
        }
    }

    /// Parse from a 13 byte buffer
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() < CSW_LENGTH {
            return None;
        }
        Some(Self {
            signature: LittleEndian::read_u32(&data[0..4]),
            tag: LittleEndian::read_u32(&data[4..8]),
            data_residue: LittleEndian::read_u32(&data[8..12]),
            status: match data[12] {
                0x00 => CommandBlockStatus::CommandPassed,
                0x01 => CommandBlockStatus::CommandFailed,
                0x02 => CommandBlockStatus::PhaseError,
                _ => CommandBlockStatus::Reserved { value: data[12] },
            },
        })
    }

    /// Convert to byte array
    pub fn to_data(&self) -> [u8; CSW_LENGTH] {
        let mut data = [0; CSW_LENGTH];
        LittleEndian::write_u32(&mut data[0..4], self.signature);
        LittleEndian::write_u32(&mut data[4..8], self.tag);
        LittleEndian::write_u32(&mut data[8..12], self.data_residue);
        data[12] = match self.status {
            CommandBlockStatus::CommandPassed => 0x00,
            CommandBlockStatus::CommandFailed => 0x01,
            CommandBlockStatus::PhaseError => 0x02,
            CommandBlockStatus::Reserved { value } => value,
        };
        data
    }

    pub fn is_valid_signature(&self) -> bool {
        self.signature == (BulkTransportSignature::CommandStatusWrapper as u32)
    }
}

/// Data stage of one command
pub enum DataStage<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataStage<'_> {
    fn len(&self) -> usize {
        match self {
            DataStage::None => 0,
            DataStage::In(buf) => buf.len(),
            DataStage::Out(buf) => buf.len(),
        }
    }

    fn direction(&self) -> DataDirection {
        match self {
            DataStage::In(_) => DataDirection::DeviceToHost,
            _ => DataDirection::HostToDevice,
        }
    }
}

/// Command transport over a shared channel for one logical unit
pub struct BulkOnlyTransport<C: UsbCommunication> {
    channel: Arc<C>,
    interface: u8,
    lun: u8,
    next_tag: AtomicU32,
}

impl<C: UsbCommunication> BulkOnlyTransport<C> {
    pub fn new(channel: Arc<C>, interface: u8, lun: u8) -> Self {
        Self {
            channel,
            interface,
            lun,
            next_tag: AtomicU32::new(1),
        }
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// Run one command: CBW, data stage, CSW. Returns the validated CSW
    pub async fn execute(
        &self,
        command: &[u8],
        data: DataStage<'_>,
    ) -> Result<CommandStatusWrapperPacket> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let cbw = CommandBlockWrapperPacket::new(
            tag,
            self.lun,
            command,
            data.len() as u32,
            data.direction(),
        );
        debug!("Send CBW: {:x?}", cbw);

        // Command Transport
        self.write_all(&cbw.to_data()).await?;

        // Data Transport
        match data {
            DataStage::None => {}
            DataStage::Out(buf) => match self.write_all(buf).await {
                Ok(()) => {}
                // device refused the data; status still follows
                Err(Error::Transport(TransferError::Stall)) => {
                    warn!("data out stalled, clearing halt");
                    self.channel.clear_halt(EndpointDirection::Out).await?
                }
                Err(e) => return Err(e),
            },
            DataStage::In(buf) => match self.channel.bulk_in(buf).await {
                Ok(_) => {}
                // device may stall short data; status still follows
                Err(TransferError::Stall) => {
                    self.channel.clear_halt(EndpointDirection::In).await?
                }
                Err(e) => return Err(e.into()),
            },
        }

        // Status Transport
        let csw = self.read_status().await?;
        debug!("Got CSW: {:x?}", csw);
        let invalid = if !csw.is_valid_signature() {
            Some("invalid CSW signature")
        } else if csw.tag != tag {
            Some("CSW tag does not match CBW")
        } else {
            match csw.status {
                CommandBlockStatus::PhaseError => Some("phase error"),
                CommandBlockStatus::Reserved { .. } => Some("reserved CSW status"),
                _ => None,
            }
        };
        match invalid {
            Some(reason) => {
                warn!("{}, running reset recovery", reason);
                self.reset_recovery().await?;
                Err(Error::Protocol(reason))
            }
            None => Ok(csw),
        }
    }

    /// Mass Storage Reset followed by Clear Feature HALT on both bulk endpoints
    pub async fn reset_recovery(&self) -> Result<()> {
        self.channel
            .control_out(ControlSetup::mass_storage_reset(self.interface), &[])
            .await?;
        self.channel.clear_halt(EndpointDirection::In).await?;
        self.channel.clear_halt(EndpointDirection::Out).await?;
        Ok(())
    }

    async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let written = self.channel.bulk_out(data).await?;
            if written == 0 {
                return Err(Error::Protocol("bulk out accepted no data"));
            }
            data = &data[written..];
        }
        Ok(())
    }

    async fn read_status(&self) -> Result<CommandStatusWrapperPacket> {
        let mut buf = [0u8; CSW_LENGTH];
        let read = match self.channel.bulk_in(&mut buf).await {
            Err(TransferError::Stall) => {
                warn!("CSW read stalled, clearing halt and retrying");
                self.channel.clear_halt(EndpointDirection::In).await?;
                self.channel.bulk_in(&mut buf).await?
            }
            other => other?,
        };
        CommandStatusWrapperPacket::from_data(&buf[..read])
            .ok_or(Error::Protocol("short CSW"))
    }
}
