use bitflags::bitflags;
use thiserror::Error;

use super::descriptor::EndpointDirection;

bitflags! {
    /// bmRequestType of a control transfer
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RequestType: u8 {
        const DEVICE_TO_HOST = 0b1000_0000;
        const TYPE_CLASS = 0b0010_0000;
        const RECIPIENT_INTERFACE = 0b0000_0001;
    }
}

/// Mass storage class specific requests
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClassSpecificRequest {
    MassStorageReset = 0xff,
    GetMaxLun = 0xfe,
}

/// Setup stage of a control transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Get Max LUN: 0xA1 / 0xFE, wValue 0, wIndex interface, 1 byte data stage
    pub fn get_max_lun(interface: u8) -> Self {
        Self {
            request_type: RequestType::DEVICE_TO_HOST
                | RequestType::TYPE_CLASS
                | RequestType::RECIPIENT_INTERFACE,
            request: ClassSpecificRequest::GetMaxLun as u8,
            value: 0,
            index: interface as u16,
        }
    }

    /// Bulk-Only Mass Storage Reset: 0x21 / 0xFF, no data stage
    pub fn mass_storage_reset(interface: u8) -> Self {
        Self {
            request_type: RequestType::TYPE_CLASS | RequestType::RECIPIENT_INTERFACE,
            request: ClassSpecificRequest::MassStorageReset as u8,
            value: 0,
            index: interface as u16,
        }
    }
}

/// USB transfer failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Endpoint halted or request not supported
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer timed out")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("access denied")]
    Access,
    /// Channel already closed
    #[error("communication channel closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Communication channel bound to one interface and its bulk endpoint pair.
/// Shared by every logical unit of the interface.
#[trait_variant::make(Send)]
pub trait UsbCommunication: Send + Sync {
    /// Device to host control transfer. Returns the data stage length
    async fn control_in(&self, setup: ControlSetup, buf: &mut [u8])
        -> Result<usize, TransferError>;
    /// Host to device control transfer
    async fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransferError>;
    /// Write to the bulk OUT endpoint
    async fn bulk_out(&self, data: &[u8]) -> Result<usize, TransferError>;
    /// Read from the bulk IN endpoint
    async fn bulk_in(&self, buf: &mut [u8]) -> Result<usize, TransferError>;
    /// Clear a halt condition on one of the paired endpoints
    async fn clear_halt(&self, direction: EndpointDirection) -> Result<(), TransferError>;
    /// Release the interface. Every later transfer fails with [`TransferError::Closed`]
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_max_lun_setup() {
        let setup = ControlSetup::get_max_lun(3);
        assert_eq!(setup.request_type.bits(), 0xa1);
        assert_eq!(setup.request, 0xfe);
        assert_eq!(setup.value, 0);
        assert_eq!(setup.index, 3);
    }

    #[test]
    fn test_reset_setup() {
        let setup = ControlSetup::mass_storage_reset(0);
        assert_eq!(setup.request_type.bits(), 0x21);
        assert_eq!(setup.request, 0xff);
    }
}
