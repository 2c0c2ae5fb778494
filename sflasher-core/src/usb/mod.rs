pub mod communication;
pub mod descriptor;
pub mod host;
pub mod pairing;

pub use communication::{ControlSetup, TransferError, UsbCommunication};
pub use descriptor::{
    EndpointDirection, TransferType, UsbDeviceInfo, UsbEndpointDescriptor, UsbInterfaceDescriptor,
};
pub use host::UsbHost;
pub use pairing::{find_mass_storage_devices, EndpointPair, MassStorageCandidate};
