//! Test doubles: an in-memory bulk-only mass storage device answering the SCSI
//! subset the driver uses, and images that fail to open or read.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

use crate::bot::{
    CommandBlockStatus, CommandBlockWrapperPacket, CommandStatusWrapperPacket, DataDirection,
};
use crate::error::{Error, Result};
use crate::source::{ImageLocator, ImageSource};
use crate::usb::communication::{ControlSetup, TransferError, UsbCommunication};
use crate::usb::descriptor::{
    EndpointDirection, TransferType, UsbDeviceInfo, UsbEndpointDescriptor, UsbInterfaceDescriptor,
};
use crate::usb::host::UsbHost;
use crate::usb::pairing::{find_mass_storage_interfaces, MassStorageCandidate};

pub struct SimulatedLun {
    media: Option<Vec<u8>>,
    block_size: usize,
    sense: (u8, u8, u8),
}

impl SimulatedLun {
    pub fn with_media(num_blocks: usize, block_size: usize) -> Self {
        Self {
            media: Some(vec![0; num_blocks * block_size]),
            block_size,
            sense: (0, 0, 0),
        }
    }

    pub fn without_media() -> Self {
        Self {
            media: None,
            block_size: 512,
            sense: (0, 0, 0),
        }
    }
}

struct PendingWrite {
    tag: u32,
    lun: usize,
    lba: u64,
    blocks: usize,
}

struct SimState {
    luns: Vec<SimulatedLun>,
    /// bulk IN responses, `Err(Stall)` where the device halts the data stage
    pending_in: VecDeque<Result<Vec<u8>, TransferError>>,
    pending_write: Option<PendingWrite>,
    writes: Vec<(u8, u64, usize)>,
    control_requests: Vec<ControlSetup>,
    halts_cleared: usize,
    phase_error: bool,
    stall_data_out: bool,
    closed: bool,
}

/// `max_lun`: `Some(n)` answers Get Max LUN with n, `None` stalls the request.
/// Clones share the same device state
#[derive(Clone)]
pub struct SimulatedBotDevice {
    max_lun: Result<Option<u8>, TransferError>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBotDevice {
    pub fn new(max_lun: Option<u8>, luns: Vec<SimulatedLun>) -> Self {
        Self::with_control_result(Ok(max_lun), luns)
    }

    pub fn with_control_result(
        max_lun: Result<Option<u8>, TransferError>,
        luns: Vec<SimulatedLun>,
    ) -> Self {
        Self {
            max_lun,
            state: Arc::new(Mutex::new(SimState {
                luns,
                pending_in: VecDeque::new(),
                pending_write: None,
                writes: Vec::new(),
                control_requests: Vec::new(),
                halts_cleared: 0,
                phase_error: false,
                stall_data_out: false,
                closed: false,
            })),
        }
    }

    /// (lun, lba, blocks) of every completed WRITE(10)
    pub fn writes(&self) -> Vec<(u8, u64, usize)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn media(&self, lun: usize) -> Option<Vec<u8>> {
        self.state.lock().unwrap().luns[lun].media.clone()
    }

    pub fn control_requests(&self) -> Vec<ControlSetup> {
        self.state.lock().unwrap().control_requests.clone()
    }

    pub fn halts_cleared(&self) -> usize {
        self.state.lock().unwrap().halts_cleared
    }

    /// Answer the next command with a phase error
    pub fn phase_error_next(&self) {
        self.state.lock().unwrap().phase_error = true;
    }

    /// Stall the data stage of the next WRITE(10)
    pub fn stall_data_out_next(&self) {
        self.state.lock().unwrap().stall_data_out = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn handle_command(state: &mut SimState, cbw: CommandBlockWrapperPacket) {
        if std::mem::take(&mut state.phase_error) {
            state.pending_in.push_back(Ok(CommandStatusWrapperPacket::new(
                cbw.tag,
                0,
                CommandBlockStatus::PhaseError,
            )
            .to_data()
            .to_vec()));
            return;
        }
        let lun = cbw.lun as usize;
        let cb = cbw.commands().to_vec();
        let status = |passed: bool| {
            if passed {
                CommandBlockStatus::CommandPassed
            } else {
                CommandBlockStatus::CommandFailed
            }
        };
        let Some(unit) = state.luns.get_mut(lun) else {
            state.pending_in.push_back(Ok(CommandStatusWrapperPacket::new(
                cbw.tag,
                0,
                CommandBlockStatus::CommandFailed,
            )
            .to_data()
            .to_vec()));
            return;
        };

        let mut data = None;
        let passed = match cb[0] {
            // TEST UNIT READY
            0x00 => {
                if unit.media.is_none() {
                    unit.sense = (0x02, 0x3a, 0x00);
                }
                unit.media.is_some()
            }
            // REQUEST SENSE
            0x03 => {
                let mut sense = vec![0u8; 18];
                sense[0] = 0x70;
                sense[2] = unit.sense.0;
                sense[7] = 10;
                sense[12] = unit.sense.1;
                sense[13] = unit.sense.2;
                unit.sense = (0, 0, 0);
                data = Some(sense);
                true
            }
            // INQUIRY
            0x12 => {
                let mut inquiry = vec![0u8; 36];
                inquiry[1] = 0x80;
                inquiry[8..16].copy_from_slice(b"SFLASHER");
                inquiry[16..32].copy_from_slice(b"SIMULATED DISK  ");
                inquiry[32..36].copy_from_slice(b"0001");
                data = Some(inquiry);
                true
            }
            // READ CAPACITY(10)
            0x25 => match &unit.media {
                Some(media) => {
                    let mut capacity = vec![0u8; 8];
                    let blocks = media.len() / unit.block_size;
                    BigEndian::write_u32(&mut capacity[0..4], blocks as u32 - 1);
                    BigEndian::write_u32(&mut capacity[4..8], unit.block_size as u32);
                    data = Some(capacity);
                    true
                }
                None => {
                    unit.sense = (0x02, 0x3a, 0x00);
                    false
                }
            },
            // WRITE(10): status follows the data stage
            0x2a => {
                state.pending_write = Some(PendingWrite {
                    tag: cbw.tag,
                    lun,
                    lba: BigEndian::read_u32(&cb[2..6]) as u64,
                    blocks: BigEndian::read_u16(&cb[7..9]) as usize,
                });
                return;
            }
            _ => {
                unit.sense = (0x05, 0x20, 0x00);
                false
            }
        };

        if let Some(mut data) = data {
            data.truncate(cbw.data_transfer_length as usize);
            state.pending_in.push_back(Ok(data));
        } else if cbw.data_direction() == DataDirection::DeviceToHost
            && cbw.data_transfer_length > 0
        {
            state.pending_in.push_back(Err(TransferError::Stall));
        }
        state.pending_in.push_back(Ok(CommandStatusWrapperPacket::new(
            cbw.tag,
            0,
            status(passed),
        )
        .to_data()
        .to_vec()));
    }

    fn handle_write_data(state: &mut SimState, write: PendingWrite, data: &[u8]) {
        let unit = &mut state.luns[write.lun];
        let offset = write.lba as usize * unit.block_size;
        let end = offset + write.blocks * unit.block_size;
        let passed = match unit.media.as_mut() {
            Some(media) if end <= media.len() && data.len() == end - offset => {
                media[offset..end].copy_from_slice(data);
                true
            }
            Some(_) => {
                unit.sense = (0x05, 0x21, 0x00);
                false
            }
            None => {
                unit.sense = (0x02, 0x3a, 0x00);
                false
            }
        };
        if passed {
            state
                .writes
                .push((write.lun as u8, write.lba, write.blocks));
        }
        let status = if passed {
            CommandBlockStatus::CommandPassed
        } else {
            CommandBlockStatus::CommandFailed
        };
        state.pending_in.push_back(Ok(CommandStatusWrapperPacket::new(write.tag, 0, status)
            .to_data()
            .to_vec()));
    }
}

impl UsbCommunication for SimulatedBotDevice {
    async fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
    ) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransferError::Closed);
        }
        state.control_requests.push(setup);
        match &self.max_lun {
            Ok(Some(n)) => {
                buf[0] = *n;
                Ok(1)
            }
            Ok(None) => Err(TransferError::Stall),
            Err(e) => Err(e.clone()),
        }
    }

    async fn control_out(&self, setup: ControlSetup, _data: &[u8]) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        state.control_requests.push(setup);
        Ok(0)
    }

    async fn bulk_out(&self, data: &[u8]) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransferError::Closed);
        }
        if let Some(write) = state.pending_write.take() {
            if std::mem::take(&mut state.stall_data_out) {
                state.luns[write.lun].sense = (0x03, 0x0c, 0x00);
                let residue = (write.blocks * state.luns[write.lun].block_size) as u32;
                state.pending_in.push_back(Ok(CommandStatusWrapperPacket::new(
                    write.tag,
                    residue,
                    CommandBlockStatus::CommandFailed,
                )
                .to_data()
                .to_vec()));
                return Err(TransferError::Stall);
            }
            Self::handle_write_data(&mut state, write, data);
            return Ok(data.len());
        }
        let Some(cbw) = CommandBlockWrapperPacket::from_data(data) else {
            return Err(TransferError::Stall);
        };
        if !cbw.is_valid_signature() {
            return Err(TransferError::Stall);
        }
        Self::handle_command(&mut state, cbw);
        Ok(data.len())
    }

    async fn bulk_in(&self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransferError::Closed);
        }
        let Some(packet) = state.pending_in.pop_front() else {
            return Err(TransferError::Timeout);
        };
        let packet = packet?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn clear_halt(&self, _direction: EndpointDirection) -> Result<(), TransferError> {
        self.state.lock().unwrap().halts_cleared += 1;
        Ok(())
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// USB device with one bulk-only mass storage interface (number 0, endpoints 0x81/0x02)
pub fn bot_device_info(bus: u8, address: u8) -> UsbDeviceInfo {
    UsbDeviceInfo {
        bus,
        address,
        vendor_id: 0x1234,
        product_id: 0x5678,
        manufacturer: Some("sflasher".into()),
        product: Some("Simulated Disk".into()),
        interfaces: vec![UsbInterfaceDescriptor {
            number: 0,
            alt_setting: 0,
            class: 8,
            subclass: 6,
            protocol: 0x50,
            endpoints: vec![
                UsbEndpointDescriptor::new(0x81, TransferType::Bulk, 512),
                UsbEndpointDescriptor::new(0x02, TransferType::Bulk, 512),
            ],
        }],
    }
}

pub fn bot_candidate() -> MassStorageCandidate {
    find_mass_storage_interfaces(&bot_device_info(1, 4)).remove(0)
}

/// Host exposing a single simulated device
pub struct SimulatedHost {
    device: SimulatedBotDevice,
    permitted: bool,
    opens: AtomicUsize,
}

impl SimulatedHost {
    pub fn new(device: SimulatedBotDevice) -> Self {
        Self {
            device,
            permitted: true,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn without_permission(device: SimulatedBotDevice) -> Self {
        Self {
            permitted: false,
            ..Self::new(device)
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl UsbHost for SimulatedHost {
    type Communication = SimulatedBotDevice;

    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        Ok(vec![bot_device_info(1, 4)])
    }

    fn has_permission(&self, _device: &UsbDeviceInfo) -> bool {
        self.permitted
    }

    fn open(&self, _candidate: &MassStorageCandidate) -> Result<SimulatedBotDevice> {
        if !self.permitted {
            return Err(Error::Transport(TransferError::Access));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(self.device.clone())
    }
}

/// Image that fails to open, or fails on its `fail_on_read`th read (1-based)
pub struct FailingImage {
    pub data: Vec<u8>,
    pub unavailable: bool,
    pub fail_on_read: Option<usize>,
    closed: Arc<AtomicBool>,
}

impl FailingImage {
    pub fn unavailable() -> Self {
        Self {
            data: Vec::new(),
            unavailable: true,
            fail_on_read: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing_read(data: Vec<u8>, read: usize) -> Self {
        Self {
            data,
            unavailable: false,
            fail_on_read: Some(read),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a source opened from this image was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ImageLocator for FailingImage {
    type Source = FailingImageSource;

    fn label(&self) -> &str {
        "failing.img"
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn open(&self) -> Result<FailingImageSource> {
        if self.unavailable {
            return Err(Error::SourceUnavailable(io::Error::new(
                io::ErrorKind::NotFound,
                "image removed",
            )));
        }
        Ok(FailingImageSource {
            data: self.data.clone(),
            position: 0,
            reads: 0,
            fail_on_read: self.fail_on_read,
            closed: self.closed.clone(),
        })
    }
}

pub struct FailingImageSource {
    data: Vec<u8>,
    position: usize,
    reads: usize,
    fail_on_read: Option<usize>,
    closed: Arc<AtomicBool>,
}

impl FailingImageSource {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ImageSource for FailingImageSource {
    fn label(&self) -> &str {
        "failing.img"
    }

    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reads += 1;
        if self.fail_on_read == Some(self.reads) {
            return Err(Error::SourceRead(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "media ejected",
            )));
        }
        let remaining = &self.data[self.position..];
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        self.position += len;
        Ok(len)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
