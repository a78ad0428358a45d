// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interrupt handler.

use core::slice;

use crate::bdt::{Bank, Direction, Owner, Toggle, Token};
use crate::device::{Packet, ReceiveFn, UsbDevice};
use crate::hw::{Control, EndpointFlags, Errors, Interrupts, Transaction, UsbHardware};
use crate::usb::{SetupPacket, UsbDir};

/// Sources we want interrupts from once the bus is up.
const RUNNING: Interrupts = Interrupts::TOKEN_DONE
    .union(Interrupts::START_OF_FRAME)
    .union(Interrupts::STALL)
    .union(Interrupts::ERROR)
    .union(Interrupts::USB_RESET)
    .union(Interrupts::SLEEP);

impl<H: UsbHardware> UsbDevice<H> {
    /// Services the controller. Call from the USB interrupt, or poll it.
    ///
    /// Keeps going until no enabled status bit is pending, in the order bus
    /// reset, link error, start-of-frame, completed transaction, then the
    /// bus state changes.
    pub fn isr(&self) {
        let hw = self.hardware();
        loop {
            let status = hw.interrupt_status();
            if status.is_empty() {
                break;
            }
            // STAT only holds still while TOKEN_DONE is set.
            let transaction = status
                .contains(Interrupts::TOKEN_DONE)
                .then(|| hw.transaction_status());
            hw.clear_interrupts(status);

            if status.contains(Interrupts::USB_RESET) {
                self.bus_reset();
                continue;
            }
            if status.contains(Interrupts::ERROR) {
                let errors = hw.error_status();
                hw.clear_errors(errors);
                log::warn!("usb: link error {:?}", errors);
            }
            if status.contains(Interrupts::START_OF_FRAME) {
                self.start_of_frame();
            }
            if let Some(transaction) = transaction {
                self.transaction_done(transaction);
            }
            if status.contains(Interrupts::SLEEP) {
                log::debug!("usb: sleep");
            }
            if status.contains(Interrupts::RESUME) {
                log::debug!("usb: resume");
            }
            if status.contains(Interrupts::ATTACH) {
                log::debug!("usb: attach");
            }
            if status.contains(Interrupts::STALL) {
                // A protocol stall on endpoint 0 lasts until the next SETUP.
                // Others stay halted until the host clears them.
                log::trace!("usb: stall sent");
                let flags = hw.endpoint_control(0);
                hw.set_endpoint_control(0, flags - EndpointFlags::STALL);
            }
        }
    }

    fn bus_reset(&self) {
        log::debug!("usb: bus reset");
        let hw = self.hardware();
        hw.set_control(Control::ODD_RESET);
        self.reset_all();
        self.with_state(|s| {
            s.configuration = 0;
            s.last_setup = SetupPacket::EMPTY;
            s.out_remaining = 0;
        });
        hw.clear_errors(Errors::all());
        hw.enable_errors(Errors::all());
        hw.clear_interrupts(Interrupts::all());
        hw.enable_interrupts(RUNNING);
        hw.set_address(0);
        hw.set_control(Control::USB_ENABLE);
    }

    /// Roughly every millisecond: give every endpoint's transmit side a
    /// nudge, in case a completion went missing, and run the reboot timer.
    fn start_of_frame(&self) {
        let hooks = self.with_state(|s| s.endpoints.map(|ep| ep.transmit_hook));
        for (endpoint, hook) in hooks.into_iter().enumerate() {
            match hook {
                Some(hook) => hook(self, endpoint),
                None => self.pump_endpoint(endpoint),
            }
        }
        self.tick_reboot_timer();
    }

    fn transaction_done(&self, transaction: Transaction) {
        let Transaction {
            endpoint,
            direction,
            bank,
        } = transaction;
        match direction {
            Direction::Tx => {
                if endpoint == 0 {
                    self.control_in_complete();
                }
                match self.with_state(|s| s.endpoints[endpoint].transmit_hook) {
                    Some(hook) => hook(self, endpoint),
                    None => self.pump_endpoint(endpoint),
                }
            }
            Direction::Rx => self.received(endpoint, bank),
        }
    }

    fn received(&self, endpoint: usize, bank: Bank) {
        let slot = self.hardware().table().slot(endpoint, Direction::Rx, bank);
        let buffer = slot.address();
        let toggle = slot.toggle();
        let token = slot.token();
        let data = if buffer.is_null() {
            &[][..]
        } else {
            // Safety: the controller handed this slot back, so the buffer is
            // ours until the slot is armed again below.
            unsafe { slice::from_raw_parts(buffer, slot.byte_count()) }
        };
        log::trace!("usb: ep{} rx {:?} {} bytes {:?}", endpoint, token, data.len(), toggle);

        let handler = match token {
            Some(Token::Setup) => self.setup_received(endpoint, bank, data),
            Some(Token::Out) => self.with_state(|s| s.endpoints[endpoint].on_receive),
            _ => None,
        };
        if let (Some(handler), Some(token)) = (handler, token) {
            handler(
                self,
                &Packet {
                    endpoint,
                    token,
                    data,
                },
            );
        }

        // The handler may have reconfigured the endpoint, in which case the
        // slot is either gone or already armed.
        //
        // Slots alternate, so the next packet here is the one after next and
        // carries this packet's PID. The other slot already waits for the
        // opposite one.
        let next = match token {
            Some(Token::Setup) => Toggle::Data0,
            _ => toggle,
        };
        self.with_state(|s| {
            let ep = &s.endpoints[endpoint];
            if ep.rx_pair.is_some() && slot.owner() == Owner::Firmware {
                // Safety: same buffer, still owned by this endpoint's pair.
                unsafe { slot.arm(buffer, usize::from(ep.max_packet_size), next) };
            }
        });

        if token == Some(Token::Setup) {
            // The controller stops answering tokens when a SETUP arrives;
            // carry on now that we're done.
            self.hardware().set_control(Control::USB_ENABLE);
        }
    }

    /// Records a SETUP and clears out whatever the previous control transfer
    /// left behind. Returns the endpoint's receive handler, unless the packet
    /// was garbage.
    fn setup_received(&self, endpoint: usize, bank: Bank, data: &[u8]) -> Option<ReceiveFn<H>> {
        let setup = SetupPacket::parse(data);
        let (handler, cancelled) = self.with_state(|s| {
            s.last_setup = setup.unwrap_or(SetupPacket::EMPTY);
            s.out_remaining = match setup {
                Some(p) if p.direction() == UsbDir::Out => p.length(),
                _ => 0,
            };
            // Token processing is suspended, so the transmit slots are safe
            // to take back. Anything in them answers the previous request.
            self.reclaim_transmit_slots(s, endpoint);
            let cancelled = self.cancel_queue(s, endpoint);
            // Data and status stages both start with DATA1, in either
            // direction. The first OUT goes to the other receive slot.
            s.endpoints[endpoint].tx_toggle = Toggle::Data1;
            let mut other = bank;
            other.flip();
            let slot = self.hardware().table().slot(endpoint, Direction::Rx, other);
            let len = usize::from(s.endpoints[endpoint].max_packet_size);
            if s.endpoints[endpoint].rx_pair.is_some() && slot.owner() == Owner::Hardware {
                let buffer = slot.address();
                slot.reclaim();
                // Safety: as above, token processing is suspended. The buffer
                // is the one the pair gave this slot.
                unsafe { slot.arm(buffer, len, Toggle::Data1) };
            }
            (s.endpoints[endpoint].on_receive, cancelled)
        });
        cancelled.notify();

        match setup {
            Some(p) => {
                log::debug!(
                    "usb: setup {:#06x} value {:#06x} index {:#06x} length {}",
                    p.request_and_type(),
                    p.value(),
                    p.index(),
                    p.length()
                );
                handler
            }
            None => {
                log::warn!("usb: ep{}: malformed setup, {} bytes", endpoint, data.len());
                let flags = self.hardware().endpoint_control(endpoint);
                self.hardware()
                    .set_endpoint_control(endpoint, flags | EndpointFlags::STALL);
                None
            }
        }
    }
}
