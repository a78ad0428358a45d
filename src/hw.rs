// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The register-level seam between the driver and the controller.
//!
//! Everything above this trait is hardware-independent logic; everything
//! below it is volatile register access (see [`crate::kinetis`]).

use bitflags::bitflags;

use crate::bdt::{Bank, BufferDescriptorTable, Direction};

bitflags! {
    /// `ISTAT` / `INTEN` bits. Status bits are write-one-to-clear.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Interrupts: u8 {
        const USB_RESET = 0x01;
        const ERROR = 0x02;
        const START_OF_FRAME = 0x04;
        const TOKEN_DONE = 0x08;
        const SLEEP = 0x10;
        const RESUME = 0x20;
        const ATTACH = 0x40;
        const STALL = 0x80;
    }
}

bitflags! {
    /// `ERRSTAT` / `ERREN` bits. Write-one-to-clear.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Errors: u8 {
        const PID = 0x01;
        const CRC5_EOF = 0x02;
        const CRC16 = 0x04;
        const DATA_FIELD_NOT_8 = 0x08;
        const BUS_TURNAROUND_TIMEOUT = 0x10;
        const DMA = 0x20;
        const BIT_STUFF = 0x80;
    }
}

bitflags! {
    /// `ENDPTn` bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EndpointFlags: u8 {
        /// ACK/NAK handshaking; clear only for isochronous endpoints.
        const HANDSHAKE = 0x01;
        const STALL = 0x02;
        const TRANSMIT = 0x04;
        const RECEIVE = 0x08;
        /// Refuse SETUP tokens.
        const CONTROL_DISABLE = 0x10;
    }
}

bitflags! {
    /// `CTL` bits we care about.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Control: u8 {
        const USB_ENABLE = 0x01;
        /// Resets every endpoint's ping-pong pointer to the even bank.
        const ODD_RESET = 0x02;
        /// Set by the controller on SETUP; token processing is suspended until
        /// firmware clears it.
        const TXSUSPEND_TOKEN_BUSY = 0x20;
    }
}

/// The last completed transaction, decoded from `STAT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub endpoint: usize,
    pub direction: Direction,
    pub bank: Bank,
}

impl Transaction {
    pub fn from_stat(stat: u8) -> Self {
        Self {
            endpoint: usize::from(stat >> 4),
            direction: if stat & 0x08 != 0 {
                Direction::Tx
            } else {
                Direction::Rx
            },
            bank: if stat & 0x04 != 0 { Bank::Odd } else { Bank::Even },
        }
    }

    /// Inverse of `from_stat`; the simulated controller uses it to fill its
    /// `STAT` FIFO.
    pub fn to_stat(self) -> u8 {
        (self.endpoint as u8) << 4 | (self.direction as u8) << 3 | (self.bank as u8) << 2
    }
}

/// Register access to a USB-FS controller.
///
/// Methods take `&self` because they stand for memory-mapped registers; the
/// device serializes access to them through its critical section where
/// ordering matters.
pub trait UsbHardware {
    /// The BDT this controller has been pointed at.
    fn table(&self) -> &BufferDescriptorTable;

    /// Powers the peripheral, points it at `table()`, enables the USB reset
    /// interrupt and turns on the D+ pull-up.
    fn attach(&self);

    /// Pending status bits that are also enabled.
    fn interrupt_status(&self) -> Interrupts;
    fn clear_interrupts(&self, which: Interrupts);
    fn enable_interrupts(&self, which: Interrupts);

    fn error_status(&self) -> Errors;
    fn clear_errors(&self, which: Errors);
    fn enable_errors(&self, which: Errors);

    /// Decodes `STAT`. Only meaningful while `TOKEN_DONE` is pending;
    /// clearing `TOKEN_DONE` advances to the next queued transaction.
    fn transaction_status(&self) -> Transaction;

    fn endpoint_control(&self, endpoint: usize) -> EndpointFlags;
    fn set_endpoint_control(&self, endpoint: usize, flags: EndpointFlags);

    fn address(&self) -> u8;
    fn set_address(&self, address: u8);

    fn set_control(&self, control: Control);
}
