// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB structure and constant definitions.
//!
//! The descriptor structs are here for applications building their
//! descriptor blobs; the driver itself never looks inside a descriptor.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 byte, and IN by an `0x80` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    pub const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    /// Works on both endpoint addresses and `bmRequestType`, which keep the
    /// direction in the same bit.
    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// `bmRequestType` values for the standard requests we answer.
pub mod request_type {
    pub const OUT_DEVICE: u8 = 0x00;
    pub const OUT_ENDPOINT: u8 = 0x02;
    pub const IN_DEVICE: u8 = 0x80;
    pub const IN_INTERFACE: u8 = 0x81;
    pub const IN_ENDPOINT: u8 = 0x82;
}

/// Request-and-type (as returned by [`SetupPacket::request_and_type`]) of
/// `SET_ADDRESS`.
pub const SET_ADDRESS: u16 = 0x0500;

/// Feature selector for `ENDPOINT_HALT`, the only endpoint feature.
pub const ENDPOINT_HALT: u16 = 0;

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Request type. Bit 7 is the data stage direction (see `UsbDir`), bits
    /// 6:5 are standard/class/vendor, bits 4:0 the recipient.
    request_type: u8,
    /// Request. Standard setup requests are in the `StandardRequest` enum.
    /// Devices can extend this with additional types as long as they don't
    /// conflict.
    request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    value: U16<LittleEndian>,
    /// Usually an interface or endpoint number.
    index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    length: U16<LittleEndian>,
}

impl SetupPacket {
    /// An all-zero packet, standing in for "no request seen yet".
    pub const EMPTY: Self = Self::new(0, 0, 0, 0, 0);

    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::from_bytes(value.to_le_bytes()),
            index: U16::from_bytes(index.to_le_bytes()),
            length: U16::from_bytes(length.to_le_bytes()),
        }
    }

    /// Reinterprets the contents of a receive buffer. Anything but exactly
    /// eight bytes is not a SETUP packet.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != core::mem::size_of::<Self>() {
            return None;
        }
        Self::read_from(bytes)
    }

    pub fn request_type(&self) -> u8 {
        self.request_type
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn value(&self) -> u16 {
        self.value.get()
    }

    pub fn index(&self) -> u16 {
        self.index.get()
    }

    pub fn length(&self) -> u16 {
        self.length.get()
    }

    /// Direction of the data stage, if there is one.
    pub fn direction(&self) -> UsbDir {
        UsbDir::of_endpoint_addr(self.request_type)
    }

    /// `bRequest` in the high byte, `bmRequestType` in the low byte. Handy for
    /// matching on the pair at once.
    pub fn request_and_type(&self) -> u16 {
        u16::from(self.request) << 8 | u16::from(self.request_type)
    }

    /// Forgets the request code so a deferred action keyed on it runs once.
    pub(crate) fn clear_request(&mut self) {
        self.request = 0;
    }
}

/// The standard USB SETUP requests, from chapter 9 of USB 2.0.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT.
    SetAddress = 0x05,
    /// Asks the device to send a certain descriptor back to the host. Always
    /// used on an IN request.
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    /// Configures a device by choosing one of the options listed in its
    /// descriptors. Always an OUT.
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
}

/// Describes a device. This is the most broad description in USB and is
/// typically the first thing the host asks for.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbDeviceDescriptor {
    /// Length of this structure, must be 18.
    pub length: u8,
    /// Type of this descriptor, must be `Device`.
    pub descriptor_type: UsbDescType,
    /// Version of the device descriptor / USB protocol, in binary-coded
    /// decimal. This is typically `0x01_10` for USB 1.1.
    pub bcd_usb: U16<LittleEndian>,
    /// Class of device, giving a broad functional area.
    pub device_class: u8,
    /// Subclass of device, refining the class.
    pub device_subclass: u8,
    /// Protocol within the subclass.
    pub device_protocol: u8,
    /// Maximum packet size of endpoint 0.
    pub max_packet_size0: u8,
    /// ID of product vendor.
    pub vendor: U16<LittleEndian>,
    /// ID of product.
    pub product: U16<LittleEndian>,
    /// Device version number, as BCD again.
    pub bcd_device: U16<LittleEndian>,
    /// Index of manufacturer name in string descriptor table.
    pub manufacturer_s: u8,
    /// Index of product name in string descriptor table.
    pub product_s: u8,
    /// Index of serial number in string descriptor table.
    pub serial_s: u8,
    /// Number of configurations supported by this device.
    pub num_configurations: u8,
}

/// Description of a single available device configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbConfigurationDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Config`.
    pub descriptor_type: UsbDescType,
    /// Total length of all descriptors in this configuration, concatenated.
    pub total_length: U16<LittleEndian>,
    /// Number of interface descriptors in this configuration.
    pub num_interfaces: u8,
    /// Number to use when requesting this configuration via a
    /// `SetConfiguration` request.
    pub configuration_value: u8,
    /// Index of this configuration's name in the string descriptor table.
    pub configuration_s: u8,
    /// Bit set of device attributes:
    ///
    /// - Bit 7 should be set (indicates that device can be bus powered in USB
    /// 1.0).
    /// - Bit 6 indicates that the device can be self-powered.
    /// - Bit 5 indicates that the device can signal remote wakeup of the host
    /// (like a keyboard).
    /// - The rest are reserved and should be zero.
    pub attributes: u8,
    /// Maximum device power consumption in units of 2mA.
    pub max_power: u8,
}

/// Description of an interface within a configuration.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbInterfaceDescriptor {
    /// Length of this structure, must be 9.
    pub length: u8,
    /// Type of this descriptor, must be `Interface`.
    pub descriptor_type: UsbDescType,
    /// ID of this interface.
    pub interface_number: u8,
    /// Allows a single `interface_number` to have several alternate interface
    /// settings. Normally there's only one, and `alternate_setting` is zero.
    pub alternate_setting: u8,
    /// Number of endpoint descriptors in this interface.
    pub num_endpoints: u8,
    /// Interface class code, distinguishing the type of interface.
    pub interface_class: u8,
    /// Interface subclass code, refining the class of interface.
    pub interface_subclass: u8,
    /// Protocol within the interface class/subclass.
    pub interface_protocol: u8,
    /// Index of interface name within string descriptor table.
    pub interface_s: u8,
}

/// Describes an endpoint within an interface.
#[repr(C)]
#[derive(Debug, AsBytes)]
pub struct UsbEndpointDescriptor {
    /// Length of this struct, must be 7.
    pub length: u8,
    /// Type of this descriptor, must be `Endpoint`.
    pub descriptor_type: UsbDescType,
    /// Address of this endpoint, where the bottom 4 bits give the endpoint
    /// number (0..15) and the top bit distinguishes IN (1) from OUT (0).
    pub endpoint_address: u8,
    /// Endpoint attributes; the most relevant part is the bottom 2 bits, which
    /// control the transfer type using the values from `UsbTransferType`.
    pub attributes: u8,
    /// Maximum packet size this endpoint can accept/produce.
    pub max_packet_size: U16<LittleEndian>,
    /// Polling interval for interrupt endpoints, in frames.
    pub interval: u8,
}

/// Types of USB descriptor. The high byte of `wValue` in `GET_DESCRIPTOR`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `UsbEndpointDescriptor`.
#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum UsbTransferType {
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn descriptor_sizes_match_chapter_9() {
        assert_eq!(core::mem::size_of::<SetupPacket>(), 8);
        assert_eq!(core::mem::size_of::<UsbDeviceDescriptor>(), 18);
        assert_eq!(core::mem::size_of::<UsbConfigurationDescriptor>(), 9);
        assert_eq!(core::mem::size_of::<UsbInterfaceDescriptor>(), 9);
        assert_eq!(core::mem::size_of::<UsbEndpointDescriptor>(), 7);
    }

    #[test]
    fn setup_packet_decodes_little_endian_fields() {
        // GET_DESCRIPTOR(Device), wLength 64, as it comes off the wire.
        let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        let setup = SetupPacket::parse(&raw).unwrap();
        assert_eq!(setup.request_and_type(), 0x0680);
        assert_eq!(setup.value(), 0x0100);
        assert_eq!(setup.length(), 64);
        assert_eq!(setup.direction(), UsbDir::In);
        assert_eq!(
            StandardRequest::from_u8(setup.request()),
            Some(StandardRequest::GetDescriptor)
        );
        assert_eq!(setup.as_bytes(), &raw);
    }

    #[test]
    fn short_or_long_setup_is_rejected() {
        assert!(SetupPacket::parse(&[0; 7]).is_none());
        assert!(SetupPacket::parse(&[0; 9]).is_none());
    }

    #[test]
    fn clearing_the_request_defuses_set_address() {
        let mut setup = SetupPacket::new(request_type::OUT_DEVICE, 0x05, 9, 0, 0);
        assert_eq!(setup.request_and_type(), SET_ADDRESS);
        setup.clear_request();
        assert_ne!(setup.request_and_type(), SET_ADDRESS);
        assert_eq!(setup.value(), 9);
    }
}
