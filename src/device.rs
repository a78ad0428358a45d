// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device object and the state it shares between foreground code and the
//! USB interrupt.

use core::cell::{RefCell, UnsafeCell};

use critical_section::Mutex;

use crate::bdt::{Bank, Token, Toggle};
use crate::config::{Config, RX_PAIRS, TX_BLOCKS, TX_BLOCK_SIZE};
use crate::hw::{EndpointFlags, UsbHardware};
use crate::pool::{BlockPool, NodeId, NodePool, PairPool, Payload, TxNode};
use crate::usb::SetupPacket;
use crate::{check_endpoint, Error, MAX_PACKET_SIZE, NUM_ENDPOINTS};

/// Looks up a descriptor blob by the `wValue`/`wIndex` of a `GET_DESCRIPTOR`
/// request. `None` makes the request STALL.
pub type DescriptorResolver = fn(value: u16, index: u16) -> Option<&'static [u8]>;

/// Called with each packet received on an endpoint, from interrupt context.
/// The packet's buffer goes back to the controller when this returns.
pub type ReceiveFn<H> = fn(&UsbDevice<H>, &Packet<'_>);

/// Replaces the transmit pump for an endpoint. Called on every IN completion
/// and every start-of-frame, in interrupt context.
pub type TransmitHook<H> = fn(&UsbDevice<H>, usize);

/// Gets first look at every control request (see [`Request`]).
pub type RequestHandler<H> = fn(&UsbDevice<H>, Request<'_>) -> Handled;

/// Called after `SET_CONFIGURATION` with the selected configuration value,
/// so class code can configure its endpoints.
pub type ConfigurationHandler<H> = fn(&UsbDevice<H>, u8);

/// Called exactly once per transmission with its endpoint and outcome.
pub type Completion = fn(usize, TxStatus);

/// How a transmission ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    /// Every byte was handed to the controller and the buffer has come back.
    Sent,
    /// Dropped by a bus reset, a reconfiguration or `cancel_all`.
    Cancelled,
}

/// A received packet, borrowed from the endpoint's receive buffer.
#[derive(Debug)]
pub struct Packet<'a> {
    pub endpoint: usize,
    pub token: Token,
    pub data: &'a [u8],
}

/// A control transfer stage offered to the request handler.
#[derive(Copy, Clone, Debug)]
pub enum Request<'a> {
    /// A new SETUP arrived.
    Setup(&'a SetupPacket),
    /// A data stage packet of a host-to-device request.
    Data(&'a SetupPacket, &'a [u8]),
}

/// The request handler's verdict.
///
/// A handler that accepts an IN request queues the reply itself on endpoint
/// 0. For OUT requests the status stage is sent for it, once `wLength` bytes
/// of data have arrived.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Handled {
    /// Not ours; try the standard requests.
    Declined,
    Accepted,
    /// Answer with a STALL.
    Stall,
}

/// Per-endpoint configuration and transmit state.
pub(crate) struct EndpointState<H> {
    /// Zero while unconfigured.
    pub max_packet_size: u16,
    pub flags: EndpointFlags,
    pub rx_pair: Option<u8>,
    pub tx_head: Option<NodeId>,
    pub tx_tail: Option<NodeId>,
    /// DATA0/1 for the next packet armed.
    pub tx_toggle: Toggle,
    /// Transmit slot the next packet goes into. Tracks the controller's
    /// ping-pong pointer.
    pub tx_bank: Bank,
    pub on_receive: Option<ReceiveFn<H>>,
    pub transmit_hook: Option<TransmitHook<H>>,
}

// Derives would demand `H: Copy`, which the hardware needn't be.
impl<H> Clone for EndpointState<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for EndpointState<H> {}

impl<H> EndpointState<H> {
    pub const fn new() -> Self {
        Self {
            max_packet_size: 0,
            flags: EndpointFlags::empty(),
            rx_pair: None,
            tx_head: None,
            tx_tail: None,
            tx_toggle: Toggle::Data0,
            tx_bank: Bank::Even,
            on_receive: None,
            transmit_hook: None,
        }
    }
}

/// Everything guarded by the device's critical section.
pub(crate) struct State<H> {
    pub endpoints: [EndpointState<H>; NUM_ENDPOINTS],
    pub nodes: NodePool,
    pub blocks: BlockPool,
    pub pairs: PairPool,
    /// The most recent SETUP, used to make sense of the stages after it.
    pub last_setup: SetupPacket,
    /// Data stage bytes still expected for a host-to-device request.
    pub out_remaining: u16,
    pub configuration: u8,
    /// Frames left before rebooting into the bootloader; zero when idle.
    pub reboot_timer: u8,
    pub request_handler: Option<RequestHandler<H>>,
    pub configuration_handler: Option<ConfigurationHandler<H>>,
}

impl<H> State<H> {
    const fn new() -> Self {
        Self {
            endpoints: [EndpointState::new(); NUM_ENDPOINTS],
            nodes: NodePool::new(),
            blocks: BlockPool::new(),
            pairs: PairPool::new(),
            last_setup: SetupPacket::EMPTY,
            out_remaining: 0,
            configuration: 0,
            reboot_timer: 0,
            request_handler: None,
            configuration_handler: None,
        }
    }

    /// Links `id` onto the tail of an endpoint queue.
    pub fn push_tail(&mut self, endpoint: usize, id: NodeId) {
        match self.endpoints[endpoint].tx_tail {
            Some(tail) => self.nodes.get_mut(tail).next = Some(id),
            None => self.endpoints[endpoint].tx_head = Some(id),
        }
        self.endpoints[endpoint].tx_tail = Some(id);
    }

    /// Unlinks the head of an endpoint queue and releases it and its blocks.
    pub fn retire_head(&mut self, endpoint: usize) -> Option<TxNode> {
        let id = self.endpoints[endpoint].tx_head?;
        let next = self.nodes.get(id).next;
        self.endpoints[endpoint].tx_head = next;
        if next.is_none() {
            self.endpoints[endpoint].tx_tail = None;
        }
        Some(self.release(id))
    }

    /// Returns a node and whatever blocks it owns to their pools.
    pub fn release(&mut self, id: NodeId) -> TxNode {
        let node = self.nodes.free(id);
        if let Payload::Owned { first, blocks } = node.payload {
            self.blocks.free(first, blocks);
        }
        node
    }
}

/// Packet memory. Ownership of each piece is tracked by the pools and the
/// descriptor OWN bits, not by the borrow checker, so it sits outside the
/// lock.
#[repr(C, align(4))]
struct Buffers {
    tx: UnsafeCell<[[u8; TX_BLOCK_SIZE]; TX_BLOCKS]>,
    rx: UnsafeCell<[[u8; 2 * MAX_PACKET_SIZE]; RX_PAIRS]>,
}

// Safety: see above; every access goes through a pointer obtained for a
// block or pair that the accessor holds.
unsafe impl Sync for Buffers {}

impl Buffers {
    const fn new() -> Self {
        Self {
            tx: UnsafeCell::new([[0; TX_BLOCK_SIZE]; TX_BLOCKS]),
            rx: UnsafeCell::new([[0; 2 * MAX_PACKET_SIZE]; RX_PAIRS]),
        }
    }

    fn tx_block(&self, first: u8) -> *mut u8 {
        (self.tx.get() as *mut u8).wrapping_add(usize::from(first) * TX_BLOCK_SIZE)
    }

    fn rx_pair(&self, pair: u8) -> *mut u8 {
        (self.rx.get() as *mut u8).wrapping_add(usize::from(pair) * 2 * MAX_PACKET_SIZE)
    }
}

/// A USB full-speed device on top of the controller `H`.
///
/// The controller is handed raw pointers into this object, so it must not
/// move after [`init`](Self::init). Put it in a `static`.
pub struct UsbDevice<H> {
    hw: H,
    pub(crate) config: Config,
    pub(crate) resolve: DescriptorResolver,
    buffers: Buffers,
    state: Mutex<RefCell<State<H>>>,
}

impl<H: UsbHardware> UsbDevice<H> {
    pub const fn new(hw: H, config: Config, resolve: DescriptorResolver) -> Self {
        Self {
            hw,
            config,
            resolve,
            buffers: Buffers::new(),
            state: Mutex::new(RefCell::new(State::new())),
        }
    }

    /// Runs `body` with the shared state, inside a critical section.
    ///
    /// Never call back into user code from `body`: it may want the state too,
    /// and the `RefCell` would panic.
    pub(crate) fn with_state<R>(&self, body: impl FnOnce(&mut State<H>) -> R) -> R {
        critical_section::with(|cs| body(&mut self.state.borrow_ref_mut(cs)))
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub(crate) fn tx_block(&self, first: u8) -> *mut u8 {
        self.buffers.tx_block(first)
    }

    pub(crate) fn rx_pair(&self, pair: u8) -> *mut u8 {
        self.buffers.rx_pair(pair)
    }

    /// Attaches to the bus. Endpoint 0 comes up on the first bus reset, which
    /// the host issues as soon as it notices us.
    pub fn init(&self) {
        log::debug!("usb: attaching");
        self.hw.attach();
    }

    /// The committed bus address. Changes only after the status stage of a
    /// `SET_ADDRESS` completes.
    pub fn address(&self) -> u8 {
        self.hw.address()
    }

    /// Configuration value selected by the host, zero if unconfigured.
    pub fn configuration(&self) -> u8 {
        self.with_state(|s| s.configuration)
    }

    pub fn is_configured(&self) -> bool {
        self.configuration() != 0
    }

    pub fn set_request_handler(&self, handler: Option<RequestHandler<H>>) {
        self.with_state(|s| s.request_handler = handler);
    }

    pub fn set_configuration_handler(&self, handler: Option<ConfigurationHandler<H>>) {
        self.with_state(|s| s.configuration_handler = handler);
    }

    /// Takes over transmit scheduling for `endpoint` (see [`TransmitHook`]).
    /// Survives bus resets.
    pub fn set_transmit_hook(&self, endpoint: usize, hook: Option<TransmitHook<H>>) -> Result<(), Error> {
        check_endpoint(endpoint)?;
        self.with_state(|s| s.endpoints[endpoint].transmit_hook = hook);
        Ok(())
    }
}
