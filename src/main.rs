// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB echo device for a Teensy-class Kinetis board.
//!
//! Enumerates as a vendor-specific device with one bulk OUT endpoint (1) and
//! one bulk IN endpoint (2). Whatever the host writes to EP1 comes back on
//! EP2.
//!
//! No interrupts: the main loop polls the controller, which keeps the flow
//! readable top to bottom.
//!
//! Core clock bring-up is not done here. Whatever runs before `main` (a
//! bootloader, or your own MCG setup in `pre_init`) must leave the PLL
//! locked at `PLL_HZ`.

#![no_std]
#![no_main]

use cortex_m_rt::{entry, pre_init};
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, U16};

use panic_halt as _;

use kinetis_usbfs::hw::EndpointFlags;
use kinetis_usbfs::kinetis::{self, Kinetis};
use kinetis_usbfs::usb::{
    UsbConfigurationDescriptor, UsbDescType, UsbDeviceDescriptor, UsbDir,
    UsbEndpointDescriptor, UsbInterfaceDescriptor, UsbTransferType,
};
use kinetis_usbfs::{Config, Packet, UsbDevice};

const PLL_HZ: u32 = 96_000_000;

const USB_CLOCK_DIVIDER: u32 = match kinetis::usb_clock_divider(PLL_HZ) {
    Some(divider) => divider,
    None => panic!("PLL_HZ can't be divided down to 48 MHz"),
};

/// Kinetis flash configuration field, read by the boot ROM from 0x400.
/// Everything unprotected, flash security off.
#[link_section = ".flashconfig"]
#[used]
static FLASH_CONFIG: [u8; 16] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xDE, 0xF9, 0xFF, 0xFF,
];

#[pre_init]
unsafe fn disable_watchdog() {
    kinetis::disable_watchdog();
}

static USB: UsbDevice<Kinetis> = UsbDevice::new(
    // Safety: this is the only `Kinetis`, and it lives in a static.
    unsafe { Kinetis::new() },
    Config {
        reboot: Some(kinetis::reboot_into_bootloader),
        ..Config::DEFAULT
    },
    descriptor,
);

#[entry]
fn main() -> ! {
    // Safety: the PLL is running at PLL_HZ (see the module docs), and USB0
    // hasn't been attached yet.
    unsafe { kinetis::select_usb_clock(USB_CLOCK_DIVIDER) };

    USB.set_configuration_handler(Some(configured));
    USB.init();

    loop {
        USB.isr();
    }
}

/// The host picked a configuration; bring up the echo endpoints. Anything
/// else (configuration 0 included) leaves them down.
fn configured(dev: &UsbDevice<Kinetis>, value: u8) {
    if value != CONFIGURATION.config.configuration_value {
        return;
    }
    let bulk = EndpointFlags::HANDSHAKE;
    let results = [
        dev.configure_endpoint(1, MAX_PACKET, bulk | EndpointFlags::RECEIVE, Some(echo)),
        dev.configure_endpoint(2, MAX_PACKET, bulk | EndpointFlags::TRANSMIT, None),
    ];
    for e in results.iter().filter_map(|r| r.as_ref().err()) {
        log::warn!("echo: can't configure endpoints: {}", e);
    }
}

fn echo(dev: &UsbDevice<Kinetis>, packet: &Packet<'_>) {
    if let Err(e) = dev.send(2, packet.data, None) {
        // The host is writing faster than it reads.
        log::warn!("echo: dropped {} bytes: {}", packet.data.len(), e);
    }
}

fn descriptor(value: u16, index: u16) -> Option<&'static [u8]> {
    let kind = UsbDescType::from_u16(value >> 8)?;
    match (kind, value as u8, index) {
        (UsbDescType::Device, 0, _) => Some(DEVICE.as_bytes()),
        (UsbDescType::Config, 0, _) => Some(CONFIGURATION.as_bytes()),
        (UsbDescType::String, 0, _) => Some(LANGUAGES),
        (UsbDescType::String, n, _) => STRINGS.get(usize::from(n) - 1).copied(),
        _ => None,
    }
}

const MAX_PACKET: u16 = 64;

static DEVICE: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: U16::from_bytes(u16::to_le_bytes(0x0200)),
    device_class: 0,
    device_subclass: 0,
    device_protocol: 0,
    max_packet_size0: Config::DEFAULT.ep0_max_packet_size as u8,
    vendor: U16::from_bytes(u16::to_le_bytes(0x16C0)),
    product: U16::from_bytes(u16::to_le_bytes(0x0486)),
    bcd_device: U16::from_bytes(u16::to_le_bytes(0x0100)),
    manufacturer_s: 1,
    product_s: 2,
    serial_s: 0,
    num_configurations: 1,
};

/// Everything `GET_DESCRIPTOR(Config)` returns, back to back.
#[repr(C)]
#[derive(AsBytes)]
struct EchoConfiguration {
    config: UsbConfigurationDescriptor,
    interface: UsbInterfaceDescriptor,
    ep_out: UsbEndpointDescriptor,
    ep_in: UsbEndpointDescriptor,
}

static CONFIGURATION: EchoConfiguration = EchoConfiguration {
    config: UsbConfigurationDescriptor {
        length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: U16::from_bytes(u16::to_le_bytes(
            core::mem::size_of::<EchoConfiguration>() as u16,
        )),
        num_interfaces: 1,
        configuration_value: 1,
        configuration_s: 0,
        attributes: 0xC0,
        max_power: 50,
    },
    interface: UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: 0,
        alternate_setting: 0,
        num_endpoints: 2,
        interface_class: 0xFF,
        interface_subclass: 0,
        interface_protocol: 0,
        interface_s: 0,
    },
    ep_out: UsbEndpointDescriptor {
        length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: UsbDir::Out.endpoint(1),
        attributes: UsbTransferType::Bulk as u8,
        max_packet_size: U16::from_bytes(u16::to_le_bytes(MAX_PACKET)),
        interval: 0,
    },
    ep_in: UsbEndpointDescriptor {
        length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: UsbDir::In.endpoint(2),
        attributes: UsbTransferType::Bulk as u8,
        max_packet_size: U16::from_bytes(u16::to_le_bytes(MAX_PACKET)),
        interval: 0,
    },
};

/// US English only.
static LANGUAGES: &[u8] = &[4, UsbDescType::String as u8, 0x09, 0x04];

// Still gross UTF-16, with the length and type bytes up front.
static STRINGS: [&[u8]; 2] = [
    b"\x10\x03K\0i\0n\0e\0t\0i\0s\0",
    b"\x12\x03U\0S\0B\0 \0E\0c\0h\0o\0",
];
