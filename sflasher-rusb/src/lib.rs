//! libusb backed [`UsbHost`](sflasher_core::usb::UsbHost) for sflasher.
//!
//! Transfers are blocking libusb calls run through
//! [`tokio::task::block_in_place`], so the multi-threaded runtime is required.

pub mod communication;
pub mod host;

pub use communication::RusbCommunication;
pub use host::RusbHost;

use sflasher_core::usb::TransferError;

/// Map a libusb error onto the transport error taxonomy
pub fn transfer_error(error: rusb::Error) -> TransferError {
    match error {
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::NoDevice => TransferError::Disconnected,
        rusb::Error::Access => TransferError::Access,
        other => TransferError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_mapping() {
        assert_eq!(transfer_error(rusb::Error::Pipe), TransferError::Stall);
        assert_eq!(transfer_error(rusb::Error::Timeout), TransferError::Timeout);
        assert_eq!(
            transfer_error(rusb::Error::NoDevice),
            TransferError::Disconnected
        );
        assert_eq!(transfer_error(rusb::Error::Access), TransferError::Access);
        assert!(matches!(
            transfer_error(rusb::Error::Overflow),
            TransferError::Other(_)
        ));
    }
}
