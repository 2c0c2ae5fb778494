use core::fmt;

use bit_field::BitField;
use num_enum::{FromPrimitive, IntoPrimitive};

// interfaceClass: 0x08 (Mass Storage)
pub const MSC_INTERFACE_CLASS: u8 = 0x08;
// interfaceSubClass: 0x06 (SCSI transparent command set)
pub const MSC_INTERFACE_SUBCLASS: u8 = 0x06;
// interfaceProtocol: 0x50 (Bulk Only Transport)
pub const MSC_INTERFACE_PROTOCOL: u8 = 0x50;

/// Endpoint transfer type (bmAttributes bit 1..0)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
    #[num_enum(default)]
    Unknown = 0xff,
}

/// Endpoint direction (bEndpointAddress bit 7)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointDirection {
    /// Host to Device
    Out,
    /// Device to Host
    In,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UsbEndpointDescriptor {
    /// bEndpointAddress
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl UsbEndpointDescriptor {
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: u16) -> Self {
        Self {
            address,
            transfer_type,
            max_packet_size,
        }
    }

    pub fn direction(&self) -> EndpointDirection {
        if self.address.get_bit(7) {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address.get_bits(0..4)
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_type == TransferType::Bulk
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UsbInterfaceDescriptor {
    /// bInterfaceNumber
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<UsbEndpointDescriptor>,
}

impl UsbInterfaceDescriptor {
    /// SCSI transparent command set over bulk-only transport
    pub fn is_bulk_only_mass_storage(&self) -> bool {
        self.class == MSC_INTERFACE_CLASS
            && self.subclass == MSC_INTERFACE_SUBCLASS
            && self.protocol == MSC_INTERFACE_PROTOCOL
    }
}

/// A USB device as reported by the host, with the interfaces of its active configuration
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub interfaces: Vec<UsbInterfaceDescriptor>,
}

impl UsbDeviceInfo {
    /// `BUS:ADDR` form used to pick a device on the command line
    pub fn location(&self) -> String {
        format!("{:03}:{:03}", self.bus, self.address)
    }

    /// Manufacturer and product strings, whichever the device reported
    pub fn full_name(&self) -> Option<String> {
        match (&self.manufacturer, &self.product) {
            (Some(manufacturer), Some(product)) => Some(format!("{} {}", manufacturer, product)),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x}",
            self.location(),
            self.vendor_id,
            self.product_id
        )?;
        if let Some(name) = self.full_name() {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}
