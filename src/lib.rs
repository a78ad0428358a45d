// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB full-speed device engine for the Kinetis USB-FS controller.
//!
//! This crate drives the device side of the USB-FS ("USB0") peripheral found
//! on Kinetis K20/K64 parts. It owns four things:
//!
//! - The endpoint registry: per-endpoint configuration plus the buffer
//!   descriptor table (BDT) the controller reads and writes behind our back.
//! - A transmit queue per endpoint, drained one packet at a time into the two
//!   ping-pong transmit slots as the controller hands them back.
//! - The interrupt dispatcher, which decodes `ISTAT`/`STAT` and routes work.
//! - The endpoint 0 control state machine answering the standard requests
//!   the host uses for enumeration.
//!
//! Descriptor contents are not our business: they're looked up through a
//! [`DescriptorResolver`] function the application provides.
//!
//! # Memory and concurrency
//!
//! There are exactly two execution contexts: foreground code and the USB
//! interrupt. Everything both of them touch (queues, pools, endpoint state and
//! the BDT ownership fields) is mutated inside a `critical_section`, and
//! callbacks run after the lock is released so they can call back in.
//!
//! Nothing here uses a heap. Transmissions and receive buffers come out of
//! fixed pools sized by the `target-*` feature, so the interrupt path never
//! allocates.
//!
//! Because the controller is handed raw addresses into the device's buffers,
//! a [`UsbDevice`] must not move once [`UsbDevice::init`] has been called. In
//! practice that means putting it in a `static`, which is why
//! [`UsbDevice::new`] is a `const fn`.

#![cfg_attr(not(test), no_std)]

pub mod bdt;
pub mod config;
mod control;
mod device;
mod endpoint;
pub mod error;
pub mod hw;
mod isr;
pub mod kinetis;
mod pool;
mod tx;
pub mod usb;

#[cfg(test)]
mod sim;

pub use crate::bdt::{Bank, Direction, Owner, Toggle, Token};
pub use crate::config::Config;
pub use crate::device::{
    Completion, ConfigurationHandler, DescriptorResolver, Handled, Packet,
    ReceiveFn, Request, RequestHandler, TransmitHook, TxStatus, UsbDevice,
};
pub use crate::error::Error;
pub use crate::hw::{EndpointFlags, UsbHardware};

/// Number of endpoints the controller implements, each with an IN and an OUT
/// half.
pub const NUM_ENDPOINTS: usize = 16;

/// Largest packet we'll configure an endpoint for. This is the full-speed
/// limit for control, bulk and interrupt endpoints.
pub const MAX_PACKET_SIZE: usize = 64;

/// Rejects endpoint numbers the hardware doesn't have.
fn check_endpoint(endpoint: usize) -> Result<(), Error> {
    if endpoint < NUM_ENDPOINTS {
        Ok(())
    } else {
        Err(Error::InvalidEndpoint)
    }
}
