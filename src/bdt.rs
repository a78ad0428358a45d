// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The buffer descriptor table (BDT).
//!
//! The USB-FS controller finds its packet buffers through a table in system
//! RAM. Every endpoint gets four slots: receive even/odd and transmit
//! even/odd. Each slot is two words, a control word and a buffer address. The
//! controller DMAs in and out of the buffer, then hands the slot back by
//! clearing the OWN bit and writing the PID of the token it just handled into
//! the control word.
//!
//! Whoever holds OWN is the only party allowed to touch the slot or its
//! buffer. Firmware gives a slot away with [`BufferDescriptor::arm`], which
//! publishes the address before the control word so the controller can never
//! observe OWN alongside a stale address.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::NUM_ENDPOINTS;

/// Largest byte count a descriptor can express (10 bits).
pub const MAX_BYTE_COUNT: usize = 1023;

// Control word layout.
const OWN: u32 = 1 << 7;
const DATA1: u32 = 1 << 6;
/// Data toggle synchronization: hardware checks the DATA0/1 PID on receive.
const DTS: u32 = 1 << 3;
const TOK_PID_SHIFT: u32 = 2;
const TOK_PID_MASK: u32 = 0xF;
const BC_SHIFT: u32 = 16;

/// Who may touch a descriptor slot right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    Firmware,
    Hardware,
}

/// DATA0/DATA1 PID used for duplicate detection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Toggle {
    Data0,
    Data1,
}

impl Toggle {
    pub fn flip(&mut self) {
        *self = self.flipped();
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Data0 => Self::Data1,
            Self::Data1 => Self::Data0,
        }
    }
}

/// Which of the two ping-pong slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Bank {
    Even = 0,
    Odd = 1,
}

impl Bank {
    pub fn flip(&mut self) {
        *self = match self {
            Self::Even => Self::Odd,
            Self::Odd => Self::Even,
        };
    }
}

/// Slot direction, from the device's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// OUT and SETUP tokens land here.
    Rx = 0,
    /// IN tokens are answered from here.
    Tx = 1,
}

/// Token PID the controller leaves in a descriptor it has handed back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Token {
    Out = 0x1,
    In = 0x9,
    Setup = 0xD,
}

/// One slot of the BDT. The layout is fixed by the hardware.
#[repr(C)]
pub struct BufferDescriptor {
    control: UnsafeCell<u32>,
    address: UnsafeCell<*mut u8>,
}

// Safety: the contents are only touched through volatile accesses, and the
// OWN bit arbitrates between firmware and the controller. Firmware-side
// mutation happens inside the device's critical section.
unsafe impl Sync for BufferDescriptor {}
unsafe impl Send for BufferDescriptor {}

impl BufferDescriptor {
    pub const fn new() -> Self {
        Self {
            control: UnsafeCell::new(0),
            address: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    fn control(&self) -> u32 {
        // Safety: aligned, always-initialized field of a live descriptor.
        unsafe { self.control.get().read_volatile() }
    }

    pub fn owner(&self) -> Owner {
        if self.control() & OWN != 0 {
            Owner::Hardware
        } else {
            Owner::Firmware
        }
    }

    pub fn toggle(&self) -> Toggle {
        if self.control() & DATA1 != 0 {
            Toggle::Data1
        } else {
            Toggle::Data0
        }
    }

    pub fn byte_count(&self) -> usize {
        (self.control() >> BC_SHIFT) as usize & MAX_BYTE_COUNT
    }

    /// The token that completed on this slot. Only meaningful once the
    /// controller has handed the slot back.
    pub fn token(&self) -> Option<Token> {
        Token::from_u32((self.control() >> TOK_PID_SHIFT) & TOK_PID_MASK)
    }

    pub fn address(&self) -> *mut u8 {
        // Safety: as for `control`.
        unsafe { self.address.get().read_volatile() }
    }

    /// Hands the slot to the controller with `len` bytes at `buffer`.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid for `len` bytes, and must not be accessed by
    /// firmware, until the controller hands the slot back or the slot is
    /// reclaimed with the endpoint disabled. The caller must hold the
    /// device's critical section.
    pub(crate) unsafe fn arm(&self, buffer: *mut u8, len: usize, toggle: Toggle) {
        debug_assert_eq!(self.owner(), Owner::Firmware);
        debug_assert!(len <= MAX_BYTE_COUNT);

        let data = match toggle {
            Toggle::Data0 => 0,
            Toggle::Data1 => DATA1,
        };
        self.address.get().write_volatile(buffer);
        // The controller may pick the slot up the instant OWN is set, so the
        // address has to land first.
        fence(Ordering::Release);
        self.control
            .get()
            .write_volatile(OWN | DTS | data | (len as u32) << BC_SHIFT);
    }

    /// Takes the slot back without waiting for the controller. Only sound
    /// while the endpoint is disabled or token processing is suspended.
    pub(crate) fn reclaim(&self) {
        // Safety: as for `control`.
        unsafe { self.control.get().write_volatile(0) }
    }

    /// Both words as the controller sees them.
    #[cfg(test)]
    pub(crate) fn raw(&self) -> (u32, usize) {
        (self.control(), self.address() as usize)
    }

    /// Plays the controller's part: hand the slot back after a transaction.
    #[cfg(test)]
    pub(crate) fn hand_back(&self, token: Token, len: usize, toggle: Toggle) {
        let data = match toggle {
            Toggle::Data0 => 0,
            Toggle::Data1 => DATA1,
        };
        let word = data | (token as u32) << TOK_PID_SHIFT | (len as u32) << BC_SHIFT;
        unsafe { self.control.get().write_volatile(word) }
    }
}

/// Index of a slot within the table. This is also `STAT >> 2`.
pub const fn index(endpoint: usize, direction: Direction, bank: Bank) -> usize {
    endpoint * 4 + direction as usize * 2 + bank as usize
}

/// The whole table. The controller only takes the upper 23 bits of its
/// address, hence the alignment.
#[repr(C, align(512))]
pub struct BufferDescriptorTable {
    slots: [BufferDescriptor; NUM_ENDPOINTS * 4],
}

impl BufferDescriptorTable {
    pub const fn new() -> Self {
        // This is a hack for initializing a static array with a non-Copy
        // type: array repeat expressions accept consts.
        const EMPTY: BufferDescriptor = BufferDescriptor::new();
        Self {
            slots: [EMPTY; NUM_ENDPOINTS * 4],
        }
    }

    /// Panics if `endpoint` is out of range; callers validate first.
    pub fn slot(&self, endpoint: usize, direction: Direction, bank: Bank) -> &BufferDescriptor {
        &self.slots[index(endpoint, direction, bank)]
    }

    pub fn as_ptr(&self) -> *const Self {
        self
    }
}

impl Default for BufferDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}
