// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint 0: the standard requests, plus the bootloader escape hatches.
//!
//! There's no explicit state machine. The SETUP cached by the interrupt
//! handler says which request the following data and status stages belong
//! to, and the DATA1 convention after SETUP takes care of the toggles.

use num_traits::FromPrimitive;

use crate::bdt::{Toggle, Token};
use crate::config::CDC_SET_LINE_CODING;
use crate::device::{Handled, Packet, Request, UsbDevice};
use crate::hw::{EndpointFlags, UsbHardware};
use crate::usb::{request_type, SetupPacket, StandardRequest, UsbDir, ENDPOINT_HALT, SET_ADDRESS};

/// Why a request gets a STALL; only ever logged.
type Refusal = &'static str;

/// `bmRequestType` bits 6:5; zero for standard requests.
const REQUEST_KIND: u8 = 0x60;

impl<H: UsbHardware> UsbDevice<H> {
    /// Receive handler installed on endpoint 0.
    pub(crate) fn control_received(&self, packet: &Packet<'_>) {
        match packet.token {
            Token::Setup => self.control_setup(),
            Token::Out => self.control_out(packet.data),
            Token::In => {}
        }
    }

    fn control_setup(&self) {
        let (setup, handler) = self.with_state(|s| (s.last_setup, s.request_handler));
        let verdict = match handler {
            Some(handler) => handler(self, Request::Setup(&setup)),
            None => Handled::Declined,
        };
        let outcome = match verdict {
            Handled::Accepted => Ok(()),
            Handled::Stall => Err("refused by request handler"),
            Handled::Declined => self.standard_request(&setup),
        };

        match outcome {
            Ok(()) => {
                // With no data stage, the status stage is an empty IN.
                let no_data = self.with_state(|s| s.out_remaining == 0);
                if setup.direction() == UsbDir::Out && no_data {
                    self.acknowledge();
                }
            }
            Err(why) => {
                log::debug!(
                    "usb: stall {:#06x}: {}",
                    setup.request_and_type(),
                    why
                );
                self.stall_control();
            }
        }
    }

    fn standard_request(&self, setup: &SetupPacket) -> Result<(), Refusal> {
        let request_and_type = setup.request_and_type();
        if self.config.reboot_request == Some(request_and_type) {
            self.schedule_reboot();
            return Ok(());
        }
        if setup.request_type() & REQUEST_KIND != 0 {
            // Line coding is only interesting for the reboot sentinel in its
            // data stage.
            return match request_and_type {
                CDC_SET_LINE_CODING if self.config.reboot_sentinel.is_some() => Ok(()),
                _ => Err("unsupported class or vendor request"),
            };
        }

        let request = StandardRequest::from_u8(setup.request()).ok_or("unknown request")?;
        match (setup.request_type(), request) {
            (request_type::OUT_DEVICE, StandardRequest::SetAddress) => {
                // Takes effect once the status stage is done; see
                // `control_in_complete`.
                Ok(())
            }
            (request_type::OUT_DEVICE, StandardRequest::SetConfiguration) => {
                self.set_configuration(setup.value() as u8);
                Ok(())
            }
            (request_type::IN_DEVICE, StandardRequest::GetConfiguration) => {
                self.reply(&[self.configuration()], setup)
            }
            (request_type::IN_DEVICE, StandardRequest::GetStatus)
            | (request_type::IN_INTERFACE, StandardRequest::GetStatus) => {
                self.reply(&[0, 0], setup)
            }
            (request_type::IN_ENDPOINT, StandardRequest::GetStatus) => {
                let halted = self
                    .hardware()
                    .endpoint_control(target_endpoint(setup))
                    .contains(EndpointFlags::STALL);
                self.reply(&[u8::from(halted), 0], setup)
            }
            (request_type::OUT_ENDPOINT, StandardRequest::ClearFeature)
            | (request_type::OUT_ENDPOINT, StandardRequest::SetFeature) => {
                if setup.value() != ENDPOINT_HALT {
                    return Err("unknown endpoint feature");
                }
                self.set_halt(target_endpoint(setup), request == StandardRequest::SetFeature);
                Ok(())
            }
            (request_type::IN_DEVICE, StandardRequest::GetDescriptor)
            | (request_type::IN_INTERFACE, StandardRequest::GetDescriptor) => {
                let blob = (self.resolve)(setup.value(), setup.index()).ok_or("no such descriptor")?;
                self.reply_static(blob, setup)
            }
            _ => Err("unsupported request"),
        }
    }

    /// Queues `data` as the data stage of an IN request, cut to `wLength`.
    fn reply(&self, data: &[u8], setup: &SetupPacket) -> Result<(), Refusal> {
        let len = data.len().min(usize::from(setup.length()));
        self.send(0, &data[..len], None).map_err(|_| "no memory for reply")?;
        self.end_reply(len, setup)
    }

    fn reply_static(&self, data: &'static [u8], setup: &SetupPacket) -> Result<(), Refusal> {
        let len = data.len().min(usize::from(setup.length()));
        self.send_static(0, &data[..len], None)
            .map_err(|_| "no memory for reply")?;
        self.end_reply(len, setup)
    }

    /// A reply shorter than the host asked for ends with a short packet. If
    /// the last real packet was full-sized, that takes an extra empty one.
    fn end_reply(&self, len: usize, setup: &SetupPacket) -> Result<(), Refusal> {
        let max_packet = usize::from(self.config.ep0_max_packet_size.max(1));
        if len != 0 && len < usize::from(setup.length()) && len % max_packet == 0 {
            self.send_static(0, &[], None)
                .map_err(|_| "no memory for reply")?;
        }
        Ok(())
    }

    /// Sends the empty status packet of a host-to-device request.
    fn acknowledge(&self) {
        if self.send_static(0, &[], None).is_err() {
            // The host will retry after the stall.
            self.stall_control();
        }
    }

    fn stall_control(&self) {
        self.with_state(|s| {
            s.out_remaining = 0;
            let flags = self.hardware().endpoint_control(0);
            self.hardware()
                .set_endpoint_control(0, flags | EndpointFlags::STALL);
        });
    }

    fn set_halt(&self, endpoint: usize, halt: bool) {
        log::debug!("usb: ep{} halt {}", endpoint, halt);
        self.with_state(|s| {
            let hw = self.hardware();
            let flags = hw.endpoint_control(endpoint);
            if halt {
                hw.set_endpoint_control(endpoint, flags | EndpointFlags::STALL);
            } else {
                hw.set_endpoint_control(endpoint, flags - EndpointFlags::STALL);
                s.endpoints[endpoint].tx_toggle = Toggle::Data0;
            }
        });
    }

    fn set_configuration(&self, value: u8) {
        log::debug!("usb: configuration {}", value);
        self.with_state(|s| s.configuration = value);
        self.rearm_endpoints();
        if let Some(handler) = self.with_state(|s| s.configuration_handler) {
            handler(self, value);
        }
    }

    /// An IN finished on endpoint 0. If it was the status stage of
    /// `SET_ADDRESS`, now is the time to switch.
    pub(crate) fn control_in_complete(&self) {
        let address = self.with_state(|s| {
            if s.last_setup.request_and_type() != SET_ADDRESS {
                return None;
            }
            s.last_setup.clear_request();
            Some(s.last_setup.value() as u8 & 0x7F)
        });
        if let Some(address) = address {
            log::debug!("usb: address {}", address);
            self.hardware().set_address(address);
        }
    }

    fn control_out(&self, data: &[u8]) {
        let (setup, remaining, handler) =
            self.with_state(|s| (s.last_setup, s.out_remaining, s.request_handler));
        if setup.direction() != UsbDir::Out || remaining == 0 {
            // Status stage of an IN request, or a data stage we've given up on.
            return;
        }

        if setup.request_and_type() == CDC_SET_LINE_CODING {
            if let (Some(&first), Some(sentinel)) = (data.first(), self.config.reboot_sentinel) {
                if first == sentinel {
                    self.schedule_reboot();
                }
            }
        }
        if let Some(handler) = handler {
            if handler(self, Request::Data(&setup, data)) == Handled::Stall {
                log::debug!("usb: stall data stage of {:#06x}", setup.request_and_type());
                self.stall_control();
                return;
            }
        }

        // A short packet ends the data stage early.
        let max_packet = usize::from(self.config.ep0_max_packet_size);
        let done = self.with_state(|s| {
            if data.len() < max_packet {
                s.out_remaining = 0;
            } else {
                s.out_remaining = s.out_remaining.saturating_sub(data.len() as u16);
            }
            s.out_remaining == 0
        });
        if done {
            self.acknowledge();
        }
    }

    fn schedule_reboot(&self) {
        let frames = self.config.reboot_delay_frames.max(1);
        log::debug!("usb: rebooting into bootloader in {} frames", frames);
        self.with_state(|s| s.reboot_timer = frames);
    }

    /// Counts down a scheduled reboot; runs once per frame.
    pub(crate) fn tick_reboot_timer(&self) {
        let due = self.with_state(|s| match s.reboot_timer {
            0 => false,
            left => {
                s.reboot_timer = left - 1;
                left == 1
            }
        });
        if due {
            match self.config.reboot {
                Some(reboot) => reboot(),
                None => log::warn!("usb: reboot requested, but there's no way to do it"),
            }
        }
    }
}

/// Endpoint number in the `wIndex` of an endpoint-recipient request.
fn target_endpoint(setup: &SetupPacket) -> usize {
    usize::from(setup.index() & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdt::Bank;
    use crate::device::TxStatus;
    use crate::sim::{self, Event, SimUsb};

    fn get_descriptor(kind: u8, index: u8, length: u16) -> SetupPacket {
        SetupPacket::new(
            request_type::IN_DEVICE,
            StandardRequest::GetDescriptor as u8,
            u16::from(kind) << 8 | u16::from(index),
            0,
            length,
        )
    }

    /// Runs an IN control transfer to completion, returning the data stage.
    fn control_read(dev: &UsbDevice<SimUsb>, setup: SetupPacket) -> Option<Vec<u8>> {
        let hw = dev.hardware();
        hw.setup(setup);
        dev.isr();
        let mut data = Vec::new();
        let mut expect = Toggle::Data1;
        loop {
            let (toggle, packet) = hw.take_in(0)?;
            dev.isr();
            assert_eq!(toggle, expect);
            expect.flip();
            let short = packet.len() < 64;
            data.extend_from_slice(&packet);
            if short || data.len() >= usize::from(setup.length()) {
                break;
            }
        }
        // Status stage.
        assert!(hw.out(0, &[], Toggle::Data1));
        dev.isr();
        Some(data)
    }

    /// Runs an OUT control transfer with no data stage, returning whether the
    /// status stage came back empty and DATA1.
    fn control_write(dev: &UsbDevice<SimUsb>, setup: SetupPacket) -> bool {
        dev.hardware().setup(setup);
        dev.isr();
        let status = dev.hardware().take_in(0);
        dev.isr();
        status == Some((Toggle::Data1, vec![]))
    }

    #[test]
    fn device_descriptor_is_served_from_the_resolver() {
        let dev = sim::device();
        let reply = control_read(&dev, get_descriptor(1, 0, 64)).unwrap();
        assert_eq!(reply, sim::DEVICE_DESCRIPTOR);
    }

    #[test]
    fn descriptor_reply_is_cut_to_wlength() {
        let dev = sim::device();
        let reply = control_read(&dev, get_descriptor(1, 0, 8)).unwrap();
        assert_eq!(reply, &sim::DEVICE_DESCRIPTOR[..8]);
    }

    #[test]
    fn full_sized_reply_gets_a_zero_length_terminator() {
        let dev = sim::device();
        // The configuration blob is exactly 64 bytes; the host asks for more.
        let hw = dev.hardware();
        hw.setup(get_descriptor(2, 0, 255));
        dev.isr();
        assert_eq!(hw.take_in(0), Some((Toggle::Data1, sim::CONFIG_DESCRIPTOR.to_vec())));
        dev.isr();
        assert_eq!(hw.take_in(0), Some((Toggle::Data0, vec![])));
        dev.isr();
        assert!(hw.out(0, &[], Toggle::Data1));
        dev.isr();
        assert_eq!(dev.transmit_in_progress(0), Ok(false));
    }

    #[test]
    fn unknown_descriptor_stalls() {
        let dev = sim::device();
        assert_eq!(control_read(&dev, get_descriptor(3, 9, 255)), None);
        // The stall is lifted once the host has seen it, ready for the next
        // SETUP.
        dev.isr();
        assert!(!dev.hardware().stalled(0));
        assert!(control_read(&dev, get_descriptor(1, 0, 18)).is_some());
    }

    #[test]
    fn address_changes_after_status_stage() {
        let dev = sim::device();
        let hw = dev.hardware();
        hw.setup(SetupPacket::new(
            request_type::OUT_DEVICE,
            StandardRequest::SetAddress as u8,
            42,
            0,
            0,
        ));
        dev.isr();
        assert_eq!(dev.address(), 0);

        assert_eq!(hw.take_in(0), Some((Toggle::Data1, vec![])));
        assert_eq!(dev.address(), 0);
        dev.isr();
        assert_eq!(dev.address(), 42);

        // A later IN on endpoint 0 doesn't apply it again.
        hw.set_address(7);
        control_read(&dev, get_descriptor(1, 0, 18)).unwrap();
        assert_eq!(dev.address(), 7);
    }

    #[test]
    fn status_requests_report_zeros_and_halts() {
        let dev = sim::device();
        let status = |recipient, index| {
            control_read(
                &dev,
                SetupPacket::new(recipient, StandardRequest::GetStatus as u8, 0, index, 2),
            )
        };
        assert_eq!(status(request_type::IN_DEVICE, 0), Some(vec![0, 0]));
        assert_eq!(status(request_type::IN_INTERFACE, 0), Some(vec![0, 0]));

        dev.configure_endpoint(2, 64, EndpointFlags::TRANSMIT, None).unwrap();
        assert_eq!(status(request_type::IN_ENDPOINT, 0x82), Some(vec![0, 0]));

        let feature = |request: StandardRequest| {
            control_write(
                &dev,
                SetupPacket::new(request_type::OUT_ENDPOINT, request as u8, ENDPOINT_HALT, 0x82, 0),
            )
        };
        assert!(feature(StandardRequest::SetFeature));
        assert!(dev.hardware().stalled(2));
        assert_eq!(status(request_type::IN_ENDPOINT, 0x82), Some(vec![1, 0]));

        assert!(feature(StandardRequest::ClearFeature));
        assert!(!dev.hardware().stalled(2));
        assert_eq!(status(request_type::IN_ENDPOINT, 0x82), Some(vec![0, 0]));
    }

    #[test]
    fn clear_halt_restarts_at_data0() {
        let dev = sim::device();
        dev.configure_endpoint(2, 64, EndpointFlags::TRANSMIT, None).unwrap();
        dev.send(2, &[1], None).unwrap();
        assert_eq!(dev.hardware().take_in(2), Some((Toggle::Data0, vec![1])));
        dev.isr();

        assert!(control_write(
            &dev,
            SetupPacket::new(
                request_type::OUT_ENDPOINT,
                StandardRequest::ClearFeature as u8,
                ENDPOINT_HALT,
                2,
                0,
            ),
        ));
        dev.send(2, &[2], None).unwrap();
        assert_eq!(dev.hardware().take_in(2), Some((Toggle::Data0, vec![2])));
    }

    #[test]
    fn set_configuration_calls_the_handler() {
        fn configured(dev: &UsbDevice<SimUsb>, value: u8) {
            sim::push_event(Event::Configured(value));
            dev.configure_endpoint(1, 64, EndpointFlags::RECEIVE | EndpointFlags::HANDSHAKE, None)
                .unwrap();
        }

        let dev = sim::device();
        dev.set_configuration_handler(Some(configured));
        sim::clear_events();

        assert!(control_write(
            &dev,
            SetupPacket::new(
                request_type::OUT_DEVICE,
                StandardRequest::SetConfiguration as u8,
                1,
                0,
                0
            ),
        ));
        assert_eq!(sim::events(), vec![Event::Configured(1)]);
        assert!(dev.is_configured());
        assert_eq!(
            control_read(
                &dev,
                SetupPacket::new(request_type::IN_DEVICE, StandardRequest::GetConfiguration as u8, 0, 0, 1)
            ),
            Some(vec![1])
        );
        assert!(dev.hardware().endpoint_control(1).contains(EndpointFlags::RECEIVE));
    }

    #[test]
    fn reconfiguring_cancels_queued_transmissions() {
        let dev = sim::device();
        dev.configure_endpoint(2, 64, EndpointFlags::TRANSMIT, None).unwrap();
        sim::clear_events();
        dev.send(2, &[9; 10], Some(sim::record_completion)).unwrap();

        assert!(control_write(
            &dev,
            SetupPacket::new(
                request_type::OUT_DEVICE,
                StandardRequest::SetConfiguration as u8,
                1,
                0,
                0
            ),
        ));
        assert_eq!(sim::events(), vec![Event::Completed(2, TxStatus::Cancelled)]);
        // Still configured for transmit, starting over at DATA0.
        dev.send(2, &[3], None).unwrap();
        assert_eq!(dev.hardware().take_in(2), Some((Toggle::Data0, vec![3])));
    }

    #[test]
    fn unsupported_requests_stall() {
        let dev = sim::device();
        dev.hardware().setup(SetupPacket::new(
            request_type::OUT_DEVICE,
            StandardRequest::SetDescriptor as u8,
            0,
            0,
            0,
        ));
        dev.isr();
        assert!(dev.hardware().stalled(0));
    }

    #[test]
    fn request_handler_goes_first() {
        fn handler(dev: &UsbDevice<SimUsb>, request: Request<'_>) -> Handled {
            match request {
                Request::Setup(setup) if setup.request_and_type() == 0x01C0 => {
                    dev.send(0, b"vendor", None).unwrap();
                    Handled::Accepted
                }
                Request::Setup(setup) if setup.request_and_type() == 0x0680 => Handled::Stall,
                Request::Data(setup, data) => {
                    sim::push_event(Event::Received(setup.index() as usize, Token::Out, data.to_vec()));
                    Handled::Accepted
                }
                Request::Setup(setup) if setup.request_and_type() == 0x0241 => Handled::Accepted,
                _ => Handled::Declined,
            }
        }

        let dev = sim::device();
        dev.set_request_handler(Some(handler));
        sim::clear_events();

        assert_eq!(
            control_read(&dev, SetupPacket::new(0xC0, 0x01, 0, 0, 64)),
            Some(b"vendor".to_vec())
        );
        // Overrides the standard table.
        assert_eq!(control_read(&dev, get_descriptor(1, 0, 18)), None);
        dev.isr();

        // A host-to-device request with a data stage: data goes to the
        // handler, and the status stage follows the last byte.
        let hw = dev.hardware();
        hw.setup(SetupPacket::new(0x41, 0x02, 0, 5, 3));
        dev.isr();
        assert_eq!(hw.take_in(0), None);
        assert!(hw.out(0, &[1, 2, 3], Toggle::Data1));
        dev.isr();
        assert_eq!(sim::events(), vec![Event::Received(5, Token::Out, vec![1, 2, 3])]);
        assert_eq!(hw.take_in(0), Some((Toggle::Data1, vec![])));
    }

    #[test]
    fn line_coding_sentinel_reboots_after_a_delay() {
        let dev = sim::device();
        let hw = dev.hardware();
        sim::clear_events();

        // SET_LINE_CODING, 134 baud.
        hw.setup(SetupPacket::new(0x21, 0x20, 0, 0, 7));
        dev.isr();
        assert!(hw.out(0, &[134, 0, 0, 0, 0, 0, 8], Toggle::Data1));
        dev.isr();
        assert_eq!(hw.take_in(0), Some((Toggle::Data1, vec![])));
        dev.isr();

        for _ in 0..sim::REBOOT_DELAY - 1 {
            hw.frame();
            dev.isr();
        }
        assert!(sim::events().is_empty());
        hw.frame();
        dev.isr();
        assert_eq!(sim::events(), vec![Event::Rebooted]);
    }

    #[test]
    fn ordinary_line_coding_does_not_reboot() {
        let dev = sim::device();
        let hw = dev.hardware();
        sim::clear_events();

        hw.setup(SetupPacket::new(0x21, 0x20, 0, 0, 7));
        dev.isr();
        assert!(hw.out(0, &[0x00, 0xC2, 0x01, 0x00, 0, 0, 8], Toggle::Data1));
        dev.isr();
        for _ in 0..2 * sim::REBOOT_DELAY {
            hw.frame();
            dev.isr();
        }
        assert!(sim::events().is_empty());
    }

    #[test]
    fn data_stage_is_accepted_whichever_slot_the_setup_used() {
        let dev = sim::device();
        let hw = dev.hardware();
        let set_line_coding = |data: &[u8]| {
            hw.setup(SetupPacket::new(0x21, 0x20, 0, 0, 7));
            dev.isr();
            let accepted = hw.out(0, data, Toggle::Data1);
            dev.isr();
            accepted && hw.take_in(0) == Some((Toggle::Data1, vec![]))
        };
        let no_data =
            || SetupPacket::new(request_type::OUT_DEVICE, StandardRequest::SetConfiguration as u8, 0, 0, 0);

        assert!(set_line_coding(&[0x00, 0xC2, 0x01, 0x00, 0, 0, 8]));
        dev.isr();
        // Two transfers with no OUT packets move the next SETUP to the
        // other receive slot, and back.
        for _ in 0..3 {
            assert!(control_write(&dev, no_data()));
            assert!(set_line_coding(&[0x80, 0x25, 0x00, 0x00, 0, 0, 8]));
            dev.isr();
        }
        assert_eq!(dev.hardware().ownership_violations(), 0);
    }

    #[test]
    fn vendor_reboot_request_is_acknowledged() {
        let dev = sim::device();
        sim::clear_events();
        assert!(control_write(&dev, SetupPacket::new(0x40, 0xFF, 0, 0, 0)));
        for _ in 0..sim::REBOOT_DELAY {
            dev.hardware().frame();
            dev.isr();
        }
        assert_eq!(sim::events(), vec![Event::Rebooted]);
    }

    #[test]
    fn new_setup_discards_stale_reply() {
        let dev = sim::device();
        let hw = dev.hardware();
        // The host asks for the device descriptor, then gives up on it.
        hw.setup(get_descriptor(1, 0, 18));
        dev.isr();
        assert_eq!(
            hw.table()
                .slot(0, crate::bdt::Direction::Tx, Bank::Even)
                .owner(),
            crate::bdt::Owner::Hardware
        );

        let reply = control_read(&dev, get_descriptor(2, 0, 9)).unwrap();
        assert_eq!(reply, &sim::CONFIG_DESCRIPTOR[..9]);
    }
}
