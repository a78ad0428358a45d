// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated USB-FS controller plus the host on the other end of the cable,
//! for tests.
//!
//! The controller half implements `UsbHardware` with write-one-to-clear
//! status registers, a `STAT` FIFO and per-endpoint ping-pong pointers. The
//! host half moves packets through the BDT the way the real controller does:
//! it only ever uses the slot its ping-pong pointer is on, NAKs if firmware
//! still owns that slot, and hands the slot back with the token PID filled
//! in.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use zerocopy::AsBytes;

use crate::bdt::{self, Bank, BufferDescriptorTable, Direction, Owner, Toggle, Token};
use crate::config::Config;
use crate::device::{Packet, TxStatus, UsbDevice};
use crate::hw::{Control, EndpointFlags, Errors, Interrupts, Transaction, UsbHardware};
use crate::usb::SetupPacket;
use crate::NUM_ENDPOINTS;

pub(crate) struct SimUsb {
    table: BufferDescriptorTable,
    istat: Cell<Interrupts>,
    inten: Cell<Interrupts>,
    errstat: Cell<Errors>,
    erren: Cell<Errors>,
    stat: RefCell<VecDeque<u8>>,
    ctl: Cell<Control>,
    addr: Cell<u8>,
    endpt: [Cell<EndpointFlags>; NUM_ENDPOINTS],
    /// Next slot the controller will use, per endpoint and direction.
    parity: [[Cell<Bank>; 2]; NUM_ENDPOINTS],
    /// Contents of each slot last time it was seen in the controller's hands.
    shadow: RefCell<[Option<(u32, usize)>; NUM_ENDPOINTS * 4]>,
    violations: Cell<usize>,
}

impl SimUsb {
    pub fn new() -> Self {
        Self {
            table: BufferDescriptorTable::new(),
            istat: Cell::new(Interrupts::empty()),
            inten: Cell::new(Interrupts::empty()),
            errstat: Cell::new(Errors::empty()),
            erren: Cell::new(Errors::empty()),
            stat: RefCell::new(VecDeque::new()),
            ctl: Cell::new(Control::empty()),
            addr: Cell::new(0),
            endpt: std::array::from_fn(|_| Cell::new(EndpointFlags::empty())),
            parity: std::array::from_fn(|_| [Cell::new(Bank::Even), Cell::new(Bank::Even)]),
            shadow: RefCell::new([None; NUM_ENDPOINTS * 4]),
            violations: Cell::new(0),
        }
    }

    // Host side.

    /// Bus reset. Whatever was in the `STAT` FIFO is gone.
    pub fn reset(&self) {
        self.observe();
        self.stat.borrow_mut().clear();
        self.istat
            .set(self.istat.get() - Interrupts::TOKEN_DONE | Interrupts::USB_RESET);
    }

    pub fn frame(&self) {
        self.observe();
        self.istat.set(self.istat.get() | Interrupts::START_OF_FRAME);
    }

    pub fn raise_error(&self, errors: Errors) {
        self.errstat.set(self.errstat.get() | errors);
        self.istat.set(self.istat.get() | Interrupts::ERROR);
    }

    pub fn setup(&self, packet: SetupPacket) {
        self.setup_raw(packet.as_bytes());
    }

    /// SETUP is never NAKed, so firmware had better have a slot ready.
    pub fn setup_raw(&self, bytes: &[u8]) {
        self.observe();
        let (bank, slot) = self.current(0, Direction::Rx);
        assert_eq!(slot.owner(), Owner::Hardware, "no receive slot for SETUP");
        self.deliver(slot, bytes);
        self.complete(0, Direction::Rx, bank, Token::Setup, bytes.len(), Toggle::Data0);
        // Token processing stays suspended until firmware says otherwise, and
        // until then firmware may take endpoint 0's slots back.
        self.ctl.set(self.ctl.get() | Control::TXSUSPEND_TOKEN_BUSY);
        let mut shadow = self.shadow.borrow_mut();
        for direction in [Direction::Rx, Direction::Tx] {
            for bank in [Bank::Even, Bank::Odd] {
                shadow[bdt::index(0, direction, bank)] = None;
            }
        }
    }

    /// Host-to-device data. Returns false if the packet was NAKed, stalled,
    /// or dropped for carrying the wrong PID.
    pub fn out(&self, endpoint: usize, data: &[u8], toggle: Toggle) -> bool {
        self.observe();
        if !self.accepts(endpoint, EndpointFlags::RECEIVE) {
            return false;
        }
        let (bank, slot) = self.current(endpoint, Direction::Rx);
        if slot.owner() == Owner::Firmware {
            return false;
        }
        // Every slot is armed with DTS. The controller ACKs a mismatched PID
        // as a retry and keeps the slot.
        if slot.toggle() != toggle {
            return false;
        }
        self.deliver(slot, data);
        self.complete(endpoint, Direction::Rx, bank, Token::Out, data.len(), toggle);
        true
    }

    /// Device-to-host data, with the PID it was sent under. `None` for a NAK
    /// or STALL.
    pub fn take_in(&self, endpoint: usize) -> Option<(Toggle, Vec<u8>)> {
        self.observe();
        if !self.accepts(endpoint, EndpointFlags::TRANSMIT) {
            return None;
        }
        let (bank, slot) = self.current(endpoint, Direction::Tx);
        if slot.owner() == Owner::Firmware {
            return None;
        }
        let len = slot.byte_count();
        let data = match len {
            0 => Vec::new(),
            // Safety: firmware armed the slot with this many bytes there.
            _ => unsafe { std::slice::from_raw_parts(slot.address(), len) }.to_vec(),
        };
        let toggle = slot.toggle();
        self.complete(endpoint, Direction::Tx, bank, Token::In, len, toggle);
        Some((toggle, data))
    }

    // Inspection.

    pub fn stalled(&self, endpoint: usize) -> bool {
        self.endpt[endpoint].get().contains(EndpointFlags::STALL)
    }

    pub fn enabled_interrupts(&self) -> Interrupts {
        self.inten.get()
    }

    pub fn armed_slots(&self, endpoint: usize, direction: Direction) -> usize {
        [Bank::Even, Bank::Odd]
            .iter()
            .filter(|&&bank| self.table.slot(endpoint, direction, bank).owner() == Owner::Hardware)
            .count()
    }

    /// Times firmware rewrote a slot the controller owned.
    pub fn ownership_violations(&self) -> usize {
        self.observe();
        self.violations.get()
    }

    // Plumbing.

    fn accepts(&self, endpoint: usize, direction: EndpointFlags) -> bool {
        if self.ctl.get().contains(Control::TXSUSPEND_TOKEN_BUSY) {
            return false;
        }
        let flags = self.endpt[endpoint].get();
        if flags.contains(EndpointFlags::STALL) {
            self.istat.set(self.istat.get() | Interrupts::STALL);
            return false;
        }
        flags.contains(direction)
    }

    fn current(&self, endpoint: usize, direction: Direction) -> (Bank, &bdt::BufferDescriptor) {
        let bank = self.parity[endpoint][direction as usize].get();
        (bank, self.table.slot(endpoint, direction, bank))
    }

    fn deliver(&self, slot: &bdt::BufferDescriptor, data: &[u8]) {
        assert!(data.len() <= slot.byte_count(), "packet overruns receive buffer");
        if !data.is_empty() {
            // Safety: the slot is ours and its buffer holds byte_count bytes.
            unsafe { slot.address().copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        }
    }

    fn complete(&self, endpoint: usize, direction: Direction, bank: Bank, token: Token, len: usize, toggle: Toggle) {
        self.table
            .slot(endpoint, direction, bank)
            .hand_back(token, len, toggle);
        self.shadow.borrow_mut()[bdt::index(endpoint, direction, bank)] = None;

        let mut next = bank;
        next.flip();
        self.parity[endpoint][direction as usize].set(next);

        let stat = Transaction {
            endpoint,
            direction,
            bank,
        }
        .to_stat();
        self.stat.borrow_mut().push_back(stat);
        self.istat.set(self.istat.get() | Interrupts::TOKEN_DONE);
    }

    /// Compares every controller-owned slot against what it held last time.
    fn observe(&self) {
        let mut shadow = self.shadow.borrow_mut();
        for endpoint in 0..NUM_ENDPOINTS {
            for direction in [Direction::Rx, Direction::Tx] {
                for bank in [Bank::Even, Bank::Odd] {
                    let slot = self.table.slot(endpoint, direction, bank);
                    let seen = &mut shadow[bdt::index(endpoint, direction, bank)];
                    if slot.owner() == Owner::Firmware {
                        *seen = None;
                        continue;
                    }
                    let now = slot.raw();
                    if matches!(*seen, Some(before) if before != now) {
                        self.violations.set(self.violations.get() + 1);
                    }
                    *seen = Some(now);
                }
            }
        }
    }
}

impl UsbHardware for SimUsb {
    fn table(&self) -> &BufferDescriptorTable {
        &self.table
    }

    fn attach(&self) {
        self.ctl.set(Control::USB_ENABLE);
        self.inten.set(Interrupts::USB_RESET);
    }

    fn interrupt_status(&self) -> Interrupts {
        self.istat.get() & self.inten.get()
    }

    fn clear_interrupts(&self, which: Interrupts) {
        let mut istat = self.istat.get() - which;
        if which.contains(Interrupts::TOKEN_DONE) {
            let mut stat = self.stat.borrow_mut();
            stat.pop_front();
            if !stat.is_empty() {
                istat |= Interrupts::TOKEN_DONE;
            }
        }
        self.istat.set(istat);
    }

    fn enable_interrupts(&self, which: Interrupts) {
        self.inten.set(which);
    }

    fn error_status(&self) -> Errors {
        self.errstat.get()
    }

    fn clear_errors(&self, which: Errors) {
        self.errstat.set(self.errstat.get() - which);
    }

    fn enable_errors(&self, which: Errors) {
        self.erren.set(which);
    }

    fn transaction_status(&self) -> Transaction {
        Transaction::from_stat(self.stat.borrow().front().copied().unwrap_or(0))
    }

    fn endpoint_control(&self, endpoint: usize) -> EndpointFlags {
        self.endpt[endpoint].get()
    }

    fn set_endpoint_control(&self, endpoint: usize, flags: EndpointFlags) {
        self.endpt[endpoint].set(flags);
    }

    fn address(&self) -> u8 {
        self.addr.get()
    }

    fn set_address(&self, address: u8) {
        self.addr.set(address);
    }

    fn set_control(&self, control: Control) {
        if control.contains(Control::ODD_RESET) {
            for pointers in &self.parity {
                for pointer in pointers {
                    pointer.set(Bank::Even);
                }
            }
        }
        self.ctl.set(control - Control::ODD_RESET);
    }
}

// Test fixtures.

/// Things the device did that a test wants to check, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Completed(usize, TxStatus),
    Received(usize, Token, Vec<u8>),
    Configured(u8),
    Hook(usize),
    /// From one of the `TAGGED` completions: which one, and how it ended.
    Tagged(usize, TxStatus),
    Rebooted,
}

thread_local! {
    static EVENTS: RefCell<Vec<Event>> = RefCell::new(Vec::new());
}

pub(crate) fn push_event(event: Event) {
    EVENTS.with(|events| events.borrow_mut().push(event));
}

pub(crate) fn events() -> Vec<Event> {
    EVENTS.with(|events| events.borrow().clone())
}

pub(crate) fn clear_events() {
    EVENTS.with(|events| events.borrow_mut().clear());
}

pub(crate) fn record_completion(endpoint: usize, status: TxStatus) {
    push_event(Event::Completed(endpoint, status));
}

/// Completion callbacks that can be told apart, for checking order.
pub(crate) const TAGGED: [crate::device::Completion; 5] =
    [tagged::<0>, tagged::<1>, tagged::<2>, tagged::<3>, tagged::<4>];

fn tagged<const N: usize>(_: usize, status: TxStatus) {
    push_event(Event::Tagged(N, status));
}

pub(crate) fn record_receive(_: &UsbDevice<SimUsb>, packet: &Packet<'_>) {
    push_event(Event::Received(packet.endpoint, packet.token, packet.data.to_vec()));
}

fn record_reboot() {
    push_event(Event::Rebooted);
}

pub(crate) const REBOOT_DELAY: u8 = 3;

pub(crate) static DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0xC0, 0x16, 0x8B, 0x04, 0x00, 0x01, 1, 2, 0, 1,
];

/// Exactly one full packet long.
pub(crate) static CONFIG_DESCRIPTOR: [u8; 64] = {
    let mut blob = [0; 64];
    blob[0] = 9;
    blob[1] = 2;
    blob[2] = 64;
    blob[4] = 1;
    blob[5] = 1;
    blob[7] = 0x80;
    blob[8] = 50;
    blob
};

fn resolve(value: u16, index: u16) -> Option<&'static [u8]> {
    match (value, index) {
        (0x0100, 0) => Some(&DEVICE_DESCRIPTOR),
        (0x0200, 0) => Some(&CONFIG_DESCRIPTOR),
        _ => None,
    }
}

/// A device that has been through its first bus reset, with endpoint 0 up.
pub(crate) fn device() -> Box<UsbDevice<SimUsb>> {
    let config = Config {
        reboot_delay_frames: REBOOT_DELAY,
        reboot: Some(record_reboot),
        ..Config::DEFAULT
    };
    let dev = Box::new(UsbDevice::new(SimUsb::new(), config, resolve));
    dev.init();
    dev.hardware().reset();
    dev.isr();
    dev
}
