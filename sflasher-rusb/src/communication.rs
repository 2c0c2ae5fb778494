use std::sync::RwLock;
use std::time::Duration;

use log::{debug, trace, warn};
use rusb::{DeviceHandle, GlobalContext};
use sflasher_core::usb::{ControlSetup, EndpointDirection, EndpointPair, TransferError, UsbCommunication};

use crate::transfer_error;

/// Claimed mass storage interface of an opened device
pub struct RusbCommunication {
    handle: RwLock<Option<DeviceHandle<GlobalContext>>>,
    interface: u8,
    endpoints: EndpointPair,
    timeout: Duration,
}

impl RusbCommunication {
    /// Claim `interface` on `handle`, detaching a kernel driver where the platform allows
    pub fn claim(
        handle: DeviceHandle<GlobalContext>,
        interface: u8,
        alt_setting: u8,
        endpoints: EndpointPair,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            // not available on every platform
            debug!("auto detach kernel driver: {}", e);
        }
        handle.claim_interface(interface).map_err(transfer_error)?;
        if alt_setting != 0 {
            handle
                .set_alternate_setting(interface, alt_setting)
                .map_err(transfer_error)?;
        }
        debug!(
            "claimed interface {} (in {:#04x}, out {:#04x})",
            interface, endpoints.bulk_in.address, endpoints.bulk_out.address
        );
        Ok(Self {
            handle: RwLock::new(Some(handle)),
            interface,
            endpoints,
            timeout,
        })
    }

    /// Run a blocking libusb call on the open handle
    fn with_handle<T>(
        &self,
        f: impl FnOnce(&DeviceHandle<GlobalContext>) -> rusb::Result<T>,
    ) -> Result<T, TransferError> {
        let guard = self.handle.read().map_err(|_| TransferError::Closed)?;
        let handle = guard.as_ref().ok_or(TransferError::Closed)?;
        tokio::task::block_in_place(|| f(handle)).map_err(transfer_error)
    }
}

impl UsbCommunication for RusbCommunication {
    async fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize, TransferError> {
        trace!("control in {:?}", setup);
        self.with_handle(|handle| {
            handle.read_control(
                setup.request_type.bits(),
                setup.request,
                setup.value,
                setup.index,
                buf,
                self.timeout,
            )
        })
    }

    async fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransferError> {
        trace!("control out {:?}", setup);
        self.with_handle(|handle| {
            handle.write_control(
                setup.request_type.bits(),
                setup.request,
                setup.value,
                setup.index,
                data,
                self.timeout,
            )
        })
    }

    async fn bulk_out(&self, data: &[u8]) -> Result<usize, TransferError> {
        let endpoint = self.endpoints.bulk_out.address;
        self.with_handle(|handle| handle.write_bulk(endpoint, data, self.timeout))
    }

    async fn bulk_in(&self, buf: &mut [u8]) -> Result<usize, TransferError> {
        let endpoint = self.endpoints.bulk_in.address;
        self.with_handle(|handle| handle.read_bulk(endpoint, buf, self.timeout))
    }

    async fn clear_halt(&self, direction: EndpointDirection) -> Result<(), TransferError> {
        let endpoint = match direction {
            EndpointDirection::In => self.endpoints.bulk_in.address,
            EndpointDirection::Out => self.endpoints.bulk_out.address,
        };
        debug!("clear halt on {:#04x}", endpoint);
        self.with_handle(|handle| handle.clear_halt(endpoint))
    }

    fn close(&self) {
        let handle = match self.handle.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.release_interface(self.interface) {
                warn!("release interface {}: {}", self.interface, e);
            }
        }
    }
}

impl Drop for RusbCommunication {
    fn drop(&mut self) {
        self.close();
    }
}
