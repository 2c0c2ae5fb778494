use log::{debug, info, warn};

use super::descriptor::{
    EndpointDirection, UsbDeviceInfo, UsbEndpointDescriptor, UsbInterfaceDescriptor,
};

/// Bulk IN and bulk OUT endpoint of one interface
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointPair {
    /// Device to Host
    pub bulk_in: UsbEndpointDescriptor,
    /// Host to Device
    pub bulk_out: UsbEndpointDescriptor,
}

/// Interface that passed the class filter and endpoint pairing
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MassStorageCandidate {
    pub device: UsbDeviceInfo,
    pub interface: UsbInterfaceDescriptor,
    pub endpoints: EndpointPair,
}

impl MassStorageCandidate {
    pub fn interface_number(&self) -> u8 {
        self.interface.number
    }
}

/// Extract exactly one bulk IN and one bulk OUT endpoint
pub fn pair_endpoints(interface: &UsbInterfaceDescriptor) -> Option<EndpointPair> {
    if interface.endpoints.len() != 2 {
        warn!(
            "Interface {} endpoint count != 2 ({})",
            interface.number,
            interface.endpoints.len()
        );
    }

    let mut bulk_in = Vec::new();
    let mut bulk_out = Vec::new();
    for endpoint in interface.endpoints.iter().filter(|ep| ep.is_bulk()) {
        debug!("Found usb endpoint: {:?}", endpoint);
        match endpoint.direction() {
            EndpointDirection::In => bulk_in.push(endpoint),
            EndpointDirection::Out => bulk_out.push(endpoint),
        }
    }

    match (bulk_in.as_slice(), bulk_out.as_slice()) {
        ([bulk_in], [bulk_out]) => Some(EndpointPair {
            bulk_in: (*bulk_in).clone(),
            bulk_out: (*bulk_out).clone(),
        }),
        _ => {
            warn!(
                "Interface {}: need one bulk in and one bulk out endpoint. In: {}, Out: {}",
                interface.number,
                bulk_in.len(),
                bulk_out.len()
            );
            None
        }
    }
}

/// Bulk-only SCSI interfaces of one device with their endpoint pairs
pub fn find_mass_storage_interfaces(device: &UsbDeviceInfo) -> Vec<MassStorageCandidate> {
    device
        .interfaces
        .iter()
        // only SCSI transparent command set with bulk transfers is supported
        .filter(|interface| interface.is_bulk_only_mass_storage())
        .filter_map(|interface| {
            info!("Found usb interface {} on {}", interface.number, device);
            let endpoints = pair_endpoints(interface)?;
            Some(MassStorageCandidate {
                device: device.clone(),
                interface: interface.clone(),
                endpoints,
            })
        })
        .collect()
}

/// Flatten [`find_mass_storage_interfaces`] over every device. An empty result means no devices found
pub fn find_mass_storage_devices<I>(devices: I) -> Vec<MassStorageCandidate>
where
    I: IntoIterator<Item = UsbDeviceInfo>,
{
    devices
        .into_iter()
        .flat_map(|device| {
            debug!("found usb device: {}", device);
            find_mass_storage_interfaces(&device)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::descriptor::TransferType;
    use rstest::rstest;

    fn bulk(address: u8) -> UsbEndpointDescriptor {
        UsbEndpointDescriptor::new(address, TransferType::Bulk, 512)
    }

    fn interrupt(address: u8) -> UsbEndpointDescriptor {
        UsbEndpointDescriptor::new(address, TransferType::Interrupt, 8)
    }

    fn interface(
        number: u8,
        class: u8,
        subclass: u8,
        protocol: u8,
        endpoints: Vec<UsbEndpointDescriptor>,
    ) -> UsbInterfaceDescriptor {
        UsbInterfaceDescriptor {
            number,
            alt_setting: 0,
            class,
            subclass,
            protocol,
            endpoints,
        }
    }

    fn device(interfaces: Vec<UsbInterfaceDescriptor>) -> UsbDeviceInfo {
        UsbDeviceInfo {
            bus: 1,
            address: 4,
            vendor_id: 0x1234,
            product_id: 0x5678,
            manufacturer: None,
            product: None,
            interfaces,
        }
    }

    #[rstest]
    #[case(vec![bulk(0x81), bulk(0x02)], true)]
    #[case(vec![bulk(0x02), bulk(0x81)], true)]
    #[case(vec![bulk(0x81), bulk(0x02), interrupt(0x83)], true)]
    #[case(vec![bulk(0x81)], false)]
    #[case(vec![bulk(0x02)], false)]
    #[case(vec![bulk(0x81), bulk(0x82), bulk(0x02)], false)]
    #[case(vec![interrupt(0x81), bulk(0x02)], false)]
    #[case(vec![], false)]
    fn test_pair_endpoints(#[case] endpoints: Vec<UsbEndpointDescriptor>, #[case] paired: bool) {
        let iface = interface(0, 8, 6, 80, endpoints);
        let pair = pair_endpoints(&iface);
        assert_eq!(pair.is_some(), paired);
        if let Some(pair) = pair {
            assert_eq!(pair.bulk_in.direction(), EndpointDirection::In);
            assert_eq!(pair.bulk_out.direction(), EndpointDirection::Out);
        }
    }

    #[rstest]
    #[case(8, 6, 80, 1)]
    #[case(8, 6, 1, 0)]
    #[case(8, 2, 80, 0)]
    #[case(3, 6, 80, 0)]
    #[case(0xff, 0xff, 0xff, 0)]
    fn test_class_filter(
        #[case] class: u8,
        #[case] subclass: u8,
        #[case] protocol: u8,
        #[case] expected: usize,
    ) {
        let dev = device(vec![interface(
            0,
            class,
            subclass,
            protocol,
            vec![bulk(0x81), bulk(0x02)],
        )]);
        assert_eq!(find_mass_storage_interfaces(&dev).len(), expected);
    }

    #[test]
    fn test_bad_interface_does_not_stop_enumeration() {
        let dev = device(vec![
            interface(0, 8, 6, 80, vec![bulk(0x81)]),
            interface(1, 3, 1, 1, vec![interrupt(0x82)]),
            interface(2, 8, 6, 80, vec![bulk(0x83), bulk(0x04)]),
        ]);
        let found = find_mass_storage_interfaces(&dev);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].interface_number(), 2);
        assert_eq!(found[0].endpoints.bulk_in.address, 0x83);
        assert_eq!(found[0].endpoints.bulk_out.address, 0x04);
    }

    #[test]
    fn test_no_devices_is_empty() {
        assert!(find_mass_storage_devices(Vec::new()).is_empty());
        let hid_only = device(vec![interface(0, 3, 1, 1, vec![interrupt(0x81)])]);
        assert!(find_mass_storage_devices(vec![hid_only]).is_empty());
    }

    #[test]
    fn test_flatten_over_devices() {
        let a = device(vec![interface(0, 8, 6, 80, vec![bulk(0x81), bulk(0x02)])]);
        let mut b = a.clone();
        b.address = 5;
        let found = find_mass_storage_devices(vec![a, b]);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].device.address, 5);
    }
}
