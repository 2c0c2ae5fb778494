use std::time::Duration;

use log::{debug, warn};
use rusb::{Device, GlobalContext, UsbContext};
use sflasher_core::usb::{
    MassStorageCandidate, TransferError, TransferType, UsbDeviceInfo, UsbEndpointDescriptor,
    UsbHost, UsbInterfaceDescriptor,
};
use sflasher_core::{Error, Result};

use crate::communication::RusbCommunication;
use crate::transfer_error;

/// Timeout for string descriptor reads during enumeration
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(200);

/// The process-wide libusb context
pub struct RusbHost {
    transfer_timeout: Duration,
}

impl RusbHost {
    pub fn new(transfer_timeout: Duration) -> Self {
        Self { transfer_timeout }
    }

    fn find(&self, info: &UsbDeviceInfo) -> Result<Device<GlobalContext>> {
        GlobalContext::default()
            .devices()
            .map_err(|e| Error::Transport(transfer_error(e)))?
            .iter()
            .find(|device| device.bus_number() == info.bus && device.address() == info.address)
            .ok_or(Error::Transport(TransferError::Disconnected))
    }
}

impl UsbHost for RusbHost {
    type Communication = RusbCommunication;

    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        let devices = rusb::devices().map_err(|e| Error::Transport(transfer_error(e)))?;
        let mut found = Vec::new();
        for device in devices.iter() {
            match device_info(&device) {
                Ok(info) => found.push(info),
                // unreadable descriptors only hide that one device
                Err(e) => debug!(
                    "skipping {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(found)
    }

    fn has_permission(&self, info: &UsbDeviceInfo) -> bool {
        match self.find(info).and_then(|device| {
            device
                .open()
                .map_err(|e| Error::Transport(transfer_error(e)))
        }) {
            Ok(_) => true,
            Err(e) => {
                warn!("cannot open {}: {}", info, e);
                false
            }
        }
    }

    fn open(&self, candidate: &MassStorageCandidate) -> Result<RusbCommunication> {
        let device = self.find(&candidate.device)?;
        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => Error::PermissionDenied(candidate.device.location()),
            other => Error::Transport(transfer_error(other)),
        })?;
        let communication = RusbCommunication::claim(
            handle,
            candidate.interface.number,
            candidate.interface.alt_setting,
            candidate.endpoints.clone(),
            self.transfer_timeout,
        )?;
        Ok(communication)
    }
}

fn device_info(device: &Device<GlobalContext>) -> rusb::Result<UsbDeviceInfo> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    let interfaces = config
        .interfaces()
        .flat_map(|interface| interface.descriptors())
        .map(|setting| UsbInterfaceDescriptor {
            number: setting.interface_number(),
            alt_setting: setting.setting_number(),
            class: setting.class_code(),
            subclass: setting.sub_class_code(),
            protocol: setting.protocol_code(),
            endpoints: setting
                .endpoint_descriptors()
                .map(|endpoint| {
                    UsbEndpointDescriptor::new(
                        endpoint.address(),
                        transfer_type(endpoint.transfer_type()),
                        endpoint.max_packet_size(),
                    )
                })
                .collect(),
        })
        .collect();

    // strings need an open handle, absent without permission
    let (manufacturer, product) = match device.open() {
        Ok(handle) => {
            let language = handle
                .read_languages(DESCRIPTOR_TIMEOUT)
                .ok()
                .and_then(|languages| languages.first().copied());
            let read = |index: Option<u8>| {
                handle
                    .read_string_descriptor(language?, index?, DESCRIPTOR_TIMEOUT)
                    .ok()
            };
            (
                read(descriptor.manufacturer_string_index()),
                read(descriptor.product_string_index()),
            )
        }
        Err(_) => (None, None),
    };

    Ok(UsbDeviceInfo {
        bus: device.bus_number(),
        address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        manufacturer,
        product,
        interfaces,
    })
}

fn transfer_type(value: rusb::TransferType) -> TransferType {
    match value {
        rusb::TransferType::Control => TransferType::Control,
        rusb::TransferType::Isochronous => TransferType::Isochronous,
        rusb::TransferType::Bulk => TransferType::Bulk,
        rusb::TransferType::Interrupt => TransferType::Interrupt,
    }
}
