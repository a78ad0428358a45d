// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint configuration and teardown.

use crate::bdt::{Bank, Direction, Toggle};
use crate::device::{EndpointState, ReceiveFn, State, UsbDevice};
use crate::hw::{EndpointFlags, UsbHardware};
use crate::tx::Cancelled;
use crate::{check_endpoint, Error, MAX_PACKET_SIZE, NUM_ENDPOINTS};

const BANKS: [Bank; 2] = [Bank::Even, Bank::Odd];

impl<H: UsbHardware> UsbDevice<H> {
    /// Sets up `endpoint` to move packets of up to `max_packet_size` bytes in
    /// the directions enabled in `flags`.
    ///
    /// Enabling `RECEIVE` takes a receive buffer pair from the pool the
    /// first time; `on_receive` then sees each packet that arrives. Dropping
    /// `RECEIVE` gives the pair back. Dropping `TRANSMIT` waits for packets
    /// the controller already holds to go out, then cancels the rest of the
    /// queue.
    pub fn configure_endpoint(
        &self,
        endpoint: usize,
        max_packet_size: u16,
        flags: EndpointFlags,
        on_receive: Option<ReceiveFn<H>>,
    ) -> Result<(), Error> {
        check_endpoint(endpoint)?;
        if max_packet_size == 0 || usize::from(max_packet_size) > MAX_PACKET_SIZE {
            return Err(Error::InvalidPacketSize);
        }
        if !flags.contains(EndpointFlags::TRANSMIT) {
            while self.transmit_slots_busy(endpoint) && self.transmit_can_drain(endpoint) {
                core::hint::spin_loop();
            }
        }

        let cancelled = self.with_state(|s| {
            self.configure_locked(s, endpoint, max_packet_size, flags, on_receive)
        })?;
        cancelled.notify();
        log::debug!(
            "usb: ep{} configured, {} bytes, {:?}",
            endpoint,
            max_packet_size,
            flags
        );
        Ok(())
    }

    /// Whether the host can still empty the armed transmit slots. A halted
    /// or transmit-disabled endpoint never hands them back; they get
    /// reclaimed instead.
    fn transmit_can_drain(&self, endpoint: usize) -> bool {
        let current = self.hardware().endpoint_control(endpoint);
        current.contains(EndpointFlags::TRANSMIT) && !current.contains(EndpointFlags::STALL)
    }

    fn configure_locked(
        &self,
        s: &mut State<H>,
        endpoint: usize,
        max_packet_size: u16,
        flags: EndpointFlags,
        on_receive: Option<ReceiveFn<H>>,
    ) -> Result<Cancelled, Error> {
        let hw = self.hardware();
        let table = hw.table();

        // Get the one fallible step out of the way before touching anything.
        let mut rx_pair = s.endpoints[endpoint].rx_pair;
        if flags.contains(EndpointFlags::RECEIVE) && rx_pair.is_none() {
            match s.pairs.alloc() {
                Some(pair) => rx_pair = Some(pair),
                None => {
                    log::warn!("usb: ep{}: receive pool exhausted", endpoint);
                    return Err(Error::NoMemory);
                }
            }
        }

        hw.set_endpoint_control(endpoint, EndpointFlags::empty());
        for bank in BANKS {
            table.slot(endpoint, Direction::Rx, bank).reclaim();
        }
        if !flags.contains(EndpointFlags::RECEIVE) {
            if let Some(pair) = rx_pair.take() {
                s.pairs.free(pair);
            }
        }
        let cancelled = if flags.contains(EndpointFlags::TRANSMIT) {
            Cancelled::none(endpoint)
        } else {
            self.reclaim_transmit_slots(s, endpoint);
            self.cancel_queue(s, endpoint)
        };

        let ep = &mut s.endpoints[endpoint];
        ep.max_packet_size = max_packet_size;
        ep.flags = flags;
        ep.rx_pair = rx_pair;
        ep.on_receive = on_receive;

        if let Some(pair) = rx_pair {
            let base = self.rx_pair(pair);
            let len = usize::from(max_packet_size);
            // Safety: the pair belongs to this endpoint until it's freed
            // above or in `reset_all`, both with the endpoint disabled.
            unsafe {
                table
                    .slot(endpoint, Direction::Rx, Bank::Even)
                    .arm(base, len, Toggle::Data0);
                table
                    .slot(endpoint, Direction::Rx, Bank::Odd)
                    .arm(base.wrapping_add(len), len, Toggle::Data1);
            }
        }
        hw.set_endpoint_control(endpoint, flags);
        Ok(cancelled)
    }

    /// Tears down every endpoint after a bus reset and brings endpoint 0 back
    /// up as the default control pipe. Transmit hooks stay in place.
    pub(crate) fn reset_all(&self) {
        for endpoint in 0..NUM_ENDPOINTS {
            let cancelled = self.with_state(|s| {
                let hw = self.hardware();
                hw.set_endpoint_control(endpoint, EndpointFlags::empty());
                let cancelled = self.cancel_queue(s, endpoint);
                for bank in BANKS {
                    hw.table().slot(endpoint, Direction::Rx, bank).reclaim();
                    hw.table().slot(endpoint, Direction::Tx, bank).reclaim();
                }
                if let Some(pair) = s.endpoints[endpoint].rx_pair {
                    s.pairs.free(pair);
                }
                s.endpoints[endpoint] = EndpointState {
                    transmit_hook: s.endpoints[endpoint].transmit_hook,
                    ..EndpointState::new()
                };
                cancelled
            });
            cancelled.notify();
        }

        let control = EndpointFlags::RECEIVE | EndpointFlags::TRANSMIT | EndpointFlags::HANDSHAKE;
        if let Err(e) = self.configure_endpoint(
            0,
            self.config.ep0_max_packet_size,
            control,
            Some(Self::control_received),
        ) {
            log::warn!("usb: can't bring up endpoint 0: {}", e);
        }
    }

    /// Puts endpoints 1 and up back in their just-configured state for a new
    /// configuration: queues cancelled, halts cleared, DATA0 on both sides.
    pub(crate) fn rearm_endpoints(&self) {
        for endpoint in 1..NUM_ENDPOINTS {
            let cancelled = self.with_state(|s| {
                let ep = s.endpoints[endpoint];
                if ep.max_packet_size == 0 {
                    return Cancelled::none(endpoint);
                }
                self.hardware()
                    .set_endpoint_control(endpoint, EndpointFlags::empty());
                self.reclaim_transmit_slots(s, endpoint);
                let cancelled = self.cancel_queue(s, endpoint);
                s.endpoints[endpoint].tx_toggle = Toggle::Data0;
                // Nothing left to cancel, and the receive pair is already
                // held, so this can't fail.
                if let Err(e) =
                    self.configure_locked(s, endpoint, ep.max_packet_size, ep.flags, ep.on_receive)
                {
                    log::warn!("usb: ep{}: can't re-arm: {}", endpoint, e);
                }
                cancelled
            });
            cancelled.notify();
        }
    }
}
