use super::communication::UsbCommunication;
use super::descriptor::UsbDeviceInfo;
use super::pairing::{find_mass_storage_devices, MassStorageCandidate};
use crate::error::Result;

/// OS USB stack: enumeration, permission state and channel creation
pub trait UsbHost: Send + Sync {
    type Communication: UsbCommunication + 'static;

    /// All attached devices with the interfaces of their active configuration
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>>;

    /// Whether the process may talk to the device
    fn has_permission(&self, device: &UsbDeviceInfo) -> bool;

    /// Claim the candidate's interface and bind a channel to its endpoints
    fn open(&self, candidate: &MassStorageCandidate) -> Result<Self::Communication>;

    /// Every paired mass storage interface on the bus
    fn mass_storage_devices(&self) -> Result<Vec<MassStorageCandidate>> {
        Ok(find_mass_storage_devices(self.devices()?))
    }
}
