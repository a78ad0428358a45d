// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time sizing and run-time device configuration.

// Pool sizes track the amount of SRAM on each part. Everything below is
// statically allocated inside the `UsbDevice`.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-mk20dx256")] {
        /// Transmission queue nodes shared by all endpoints.
        pub const TX_NODES: usize = 32;
        /// 64-byte blocks backing copied transmit data.
        pub const TX_BLOCKS: usize = 32;
        /// Receive buffer pairs (one per receiving endpoint).
        pub const RX_PAIRS: usize = 8;
    } else if #[cfg(feature = "target-mk64fx512")] {
        pub const TX_NODES: usize = 64;
        pub const TX_BLOCKS: usize = 64;
        pub const RX_PAIRS: usize = 16;
    } else if #[cfg(feature = "target-mk20dx128")] {
        pub const TX_NODES: usize = 16;
        pub const TX_BLOCKS: usize = 16;
        pub const RX_PAIRS: usize = 4;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

/// Size of one transmit block. Matches the largest packet so a block never
/// straddles two packets' worth of bookkeeping.
pub const TX_BLOCK_SIZE: usize = crate::MAX_PACKET_SIZE;

/// Request-and-type of the CDC `SET_LINE_CODING` request, which carries the
/// reboot sentinel in its data stage.
pub const CDC_SET_LINE_CODING: u16 = 0x2021;

/// Run-time knobs for a [`UsbDevice`](crate::UsbDevice).
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Max packet size of endpoint 0. Must agree with `bMaxPacketSize0` in
    /// the device descriptor.
    pub ep0_max_packet_size: u16,
    /// When set, a `SET_LINE_CODING` whose data stage begins with this byte
    /// schedules a reboot into the bootloader. 134 is the baud rate loader
    /// tools use to ask for it.
    pub reboot_sentinel: Option<u8>,
    /// When set, a SETUP with this request-and-type is acknowledged with no
    /// data and schedules a reboot into the bootloader.
    pub reboot_request: Option<u16>,
    /// Start-of-frame ticks between scheduling a reboot and performing it,
    /// giving the status stage time to reach the host.
    pub reboot_delay_frames: u8,
    /// Performs the reboot. Without one, reboot requests are only logged.
    pub reboot: Option<fn()>,
}

impl Config {
    pub const DEFAULT: Self = Self {
        ep0_max_packet_size: 64,
        reboot_sentinel: Some(134),
        // Vendor, host-to-device, device recipient, bRequest 0xFF.
        reboot_request: Some(0xFF40),
        reboot_delay_frames: 15,
        reboot: None,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
