use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::block::{BlockDevice, BlockDriverFactory};
use crate::error::{Error, Result};
use crate::job::FlashTarget;
use crate::usb::communication::{ControlSetup, TransferError, UsbCommunication};
use crate::usb::host::UsbHost;
use crate::usb::pairing::MassStorageCandidate;

/// Largest LUN index Bulk-Only Transport can address
pub const MAX_LUN_LIMIT: u8 = 15;

/// One paired mass storage interface, turned into zero or one usable block device.
///
/// The channel is opened on first use and shared by all logical units. Units
/// reporting no media are recorded without a handle.
pub struct MassStorageSession<H, F>
where
    H: UsbHost,
    F: BlockDriverFactory<H::Communication>,
{
    host: Arc<H>,
    candidate: MassStorageCandidate,
    factory: F,
    channel: Option<Arc<H::Communication>>,
    max_lun: u8,
    luns: BTreeMap<u8, Option<F::Device>>,
    closed: bool,
}

impl<H, F> MassStorageSession<H, F>
where
    H: UsbHost,
    F: BlockDriverFactory<H::Communication>,
{
    pub fn new(host: Arc<H>, candidate: MassStorageCandidate, factory: F) -> Self {
        Self {
            host,
            candidate,
            factory,
            channel: None,
            max_lun: 0,
            luns: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn candidate(&self) -> &MassStorageCandidate {
        &self.candidate
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Highest LUN reported by the device, 0 until opened
    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    /// Every initialized LUN and whether it carries media
    pub fn luns(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.luns.iter().map(|(lun, device)| (*lun, device.is_some()))
    }

    /// Lowest LUN with media
    pub fn block_device(&mut self) -> Option<&mut F::Device> {
        self.luns.values_mut().find_map(|device| device.as_mut())
    }

    /// Check permission, claim the interface and initialize every logical unit.
    /// Opening an open session does nothing. Succeeds without a block device when
    /// no unit has media.
    pub async fn open(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if self.channel.is_some() {
            return Ok(());
        }

        let device = &self.candidate.device;
        if !self.host.has_permission(device) {
            return Err(Error::PermissionDenied(device.location()));
        }
        let channel = Arc::new(self.host.open(&self.candidate)?);
        debug!(
            "opened interface {} of {}",
            self.candidate.interface_number(),
            device
        );

        match self.initialize(&channel).await {
            Ok(()) => {
                self.channel = Some(channel);
                Ok(())
            }
            Err(e) => {
                channel.close();
                self.luns.clear();
                self.max_lun = 0;
                Err(e)
            }
        }
    }

    async fn initialize(&mut self, channel: &Arc<H::Communication>) -> Result<()> {
        let interface = self.candidate.interface_number();
        self.max_lun = query_max_lun(channel.as_ref(), interface).await?;
        info!("{}: max lun {}", self.candidate.device, self.max_lun);

        for lun in 0..=self.max_lun {
            let mut device = self.factory.create(channel.clone(), interface, lun);
            match device.init().await {
                Ok(()) => {
                    info!("LUN {}: media present", lun);
                    self.luns.insert(lun, Some(device));
                }
                Err(Error::MediaAbsent(_)) => {
                    info!("LUN {}: no media", lun);
                    self.luns.insert(lun, None);
                }
                Err(e) => return Err(e),
            }
        }
        if self.block_device().is_none() {
            warn!("{}: no logical unit with media", self.candidate.device);
        }
        Ok(())
    }

    /// Release the channel. Every handle becomes invalid. Safe to call repeatedly
    pub fn close(&mut self) {
        self.luns.clear();
        if let Some(channel) = self.channel.take() {
            channel.close();
            debug!("closed {}", self.candidate.device);
        }
        self.closed = true;
    }
}

impl<H, F> Drop for MassStorageSession<H, F>
where
    H: UsbHost,
    F: BlockDriverFactory<H::Communication>,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<H, F> FlashTarget for MassStorageSession<H, F>
where
    H: UsbHost,
    F: BlockDriverFactory<H::Communication>,
{
    type Device = F::Device;

    fn label(&self) -> String {
        self.candidate.device.to_string()
    }

    async fn acquire(&mut self) -> Result<&mut F::Device> {
        self.open().await?;
        self.block_device().ok_or(Error::NoMedia)
    }

    async fn release(&mut self) {
        self.close();
    }
}

/// Class request Get Max LUN. Stall or an empty data stage means a single unit
pub async fn query_max_lun<C: UsbCommunication>(channel: &C, interface: u8) -> Result<u8> {
    let mut buf = [0u8; 1];
    match channel
        .control_in(ControlSetup::get_max_lun(interface), &mut buf)
        .await
    {
        Ok(0) => {
            debug!("Get Max LUN returned no data");
            Ok(0)
        }
        Ok(_) if buf[0] > MAX_LUN_LIMIT => {
            warn!("Get Max LUN returned {}, using 0", buf[0]);
            Ok(0)
        }
        Ok(_) => Ok(buf[0]),
        Err(TransferError::Stall) => {
            debug!("Get Max LUN not supported");
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}
