// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transmit queues.
//!
//! Each endpoint has a FIFO of pending transmissions. The pump moves the head
//! transmission into the endpoint's two transmit slots one packet at a time,
//! alternating slots and DATA0/DATA1, and retires it once the controller has
//! handed back the last slot it used.

use core::ptr;

use crate::bdt::{Bank, Direction, Owner, MAX_BYTE_COUNT};
use crate::config::{TX_BLOCK_SIZE, TX_NODES};
use crate::device::{Completion, State, TxStatus, UsbDevice};
use crate::hw::{EndpointFlags, UsbHardware};
use crate::pool::{NodeId, Payload, TxNode};
use crate::{check_endpoint, Error};

/// Completions owed for transmissions dropped under the lock, delivered
/// once it has been released.
pub(crate) struct Cancelled {
    endpoint: usize,
    callbacks: [Option<Completion>; TX_NODES],
    count: usize,
}

impl Cancelled {
    pub(crate) const fn none(endpoint: usize) -> Self {
        Self {
            endpoint,
            callbacks: [None; TX_NODES],
            count: 0,
        }
    }

    fn push(&mut self, callback: Option<Completion>) {
        if let (Some(cb), Some(entry)) = (callback, self.callbacks.get_mut(self.count)) {
            *entry = Some(cb);
            self.count += 1;
        }
    }

    pub(crate) fn notify(self) {
        for cb in self.callbacks[..self.count].iter().flatten() {
            cb(self.endpoint, TxStatus::Cancelled);
        }
    }
}

impl<H: UsbHardware> UsbDevice<H> {
    /// Copies `data` and queues it on `endpoint`.
    ///
    /// Returns as soon as the data is queued. `callback`, if any, runs once
    /// the controller is done with the last packet, or when the transmission
    /// is cancelled. On error nothing was queued and `callback` never runs.
    pub fn send(&self, endpoint: usize, data: &[u8], callback: Option<Completion>) -> Result<(), Error> {
        self.check_transmitter(endpoint)?;
        let node = self.prepare(data, callback)?;
        self.enqueue(node, endpoint)?;
        self.pump_endpoint(endpoint);
        Ok(())
    }

    /// Like [`send`](Self::send), but sends straight out of `data` instead of
    /// copying it.
    pub fn send_static(
        &self,
        endpoint: usize,
        data: &'static [u8],
        callback: Option<Completion>,
    ) -> Result<(), Error> {
        self.check_transmitter(endpoint)?;
        let payload = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Static(data)
        };
        let node = self
            .with_state(|s| s.nodes.alloc(TxNode::new(payload, data.len(), callback)))
            .ok_or_else(Self::out_of_memory)?;
        self.enqueue(node, endpoint)?;
        self.pump_endpoint(endpoint);
        Ok(())
    }

    /// Like [`send`](Self::send), but fails with [`Error::Busy`] if anything is
    /// already queued on `endpoint`. Transmit slots still being drained by
    /// the controller don't count.
    pub fn try_send(&self, endpoint: usize, data: &[u8], callback: Option<Completion>) -> Result<(), Error> {
        self.check_transmitter(endpoint)?;
        if self.with_state(|s| s.endpoints[endpoint].tx_head.is_some()) {
            return Err(Error::Busy);
        }
        let node = self.prepare(data, callback)?;
        self.link(endpoint, node, true)?;
        self.pump_endpoint(endpoint);
        Ok(())
    }

    /// Moves the next packet of `endpoint`'s queue into a free transmit slot,
    /// or retires a transmission the controller has finished with.
    ///
    /// The interrupt handler does this on its own; transmit hooks may call
    /// it to fall back on the default behaviour.
    pub fn pump(&self, endpoint: usize) -> Result<(), Error> {
        check_endpoint(endpoint)?;
        self.pump_endpoint(endpoint);
        Ok(())
    }

    /// Drops everything queued on `endpoint` and takes back its transmit
    /// slots without waiting for the controller. Callbacks see
    /// [`TxStatus::Cancelled`].
    pub fn cancel_all(&self, endpoint: usize) -> Result<(), Error> {
        check_endpoint(endpoint)?;
        let cancelled = self.with_state(|s| {
            let flags = self.hardware().endpoint_control(endpoint);
            self.hardware()
                .set_endpoint_control(endpoint, flags - EndpointFlags::TRANSMIT);
            self.reclaim_transmit_slots(s, endpoint);
            self.hardware().set_endpoint_control(endpoint, flags);
            self.cancel_queue(s, endpoint)
        });
        cancelled.notify();
        Ok(())
    }

    /// Bytes queued on `endpoint` that haven't been handed to the controller.
    pub fn pending_bytes(&self, endpoint: usize) -> Result<usize, Error> {
        check_endpoint(endpoint)?;
        Ok(self.with_state(|s| {
            let mut total = 0;
            let mut cursor = s.endpoints[endpoint].tx_head;
            while let Some(id) = cursor {
                let node = s.nodes.get(id);
                total += node.remaining();
                cursor = node.next;
            }
            total
        }))
    }

    /// Whether anything is queued on `endpoint` or still held by the
    /// controller in one of its transmit slots.
    pub fn transmit_in_progress(&self, endpoint: usize) -> Result<bool, Error> {
        check_endpoint(endpoint)?;
        Ok(self.with_state(|s| s.endpoints[endpoint].tx_head.is_some()) || self.transmit_slots_busy(endpoint))
    }

    pub(crate) fn transmit_slots_busy(&self, endpoint: usize) -> bool {
        let table = self.hardware().table();
        [Bank::Even, Bank::Odd]
            .iter()
            .any(|&bank| table.slot(endpoint, Direction::Tx, bank).owner() == Owner::Hardware)
    }

    /// Builds an unqueued transmission holding a copy of `data`.
    pub(crate) fn prepare(&self, data: &[u8], callback: Option<Completion>) -> Result<NodeId, Error> {
        let count = (data.len() + TX_BLOCK_SIZE - 1) / TX_BLOCK_SIZE;
        let (node, payload) = self
            .with_state(|s| {
                let payload = match count {
                    0 => Payload::Empty,
                    _ => {
                        let first = s.blocks.alloc(count)?;
                        Payload::Owned {
                            first,
                            blocks: count as u8,
                        }
                    }
                };
                match s.nodes.alloc(TxNode::new(payload, data.len(), callback)) {
                    Some(node) => Some((node, payload)),
                    None => {
                        if let Payload::Owned { first, blocks } = payload {
                            s.blocks.free(first, blocks);
                        }
                        None
                    }
                }
            })
            .ok_or_else(Self::out_of_memory)?;

        if let Payload::Owned { first, .. } = payload {
            // Safety: the blocks were just allocated to a node nobody else
            // can see yet, and they span at least `data.len()` bytes.
            unsafe {
                self.tx_block(first)
                    .copy_from_nonoverlapping(data.as_ptr(), data.len());
            }
        }
        Ok(node)
    }

    /// Appends a prepared transmission to `endpoint`'s queue. Doesn't start
    /// anything; the next pump will.
    pub(crate) fn enqueue(&self, node: NodeId, endpoint: usize) -> Result<(), Error> {
        self.link(endpoint, node, false)
    }

    /// Releases `node` instead of linking it if the endpoint has stopped
    /// transmitting meanwhile, or, when `exclusive`, if the queue isn't empty.
    fn link(&self, endpoint: usize, node: NodeId, exclusive: bool) -> Result<(), Error> {
        self.with_state(|s| {
            let ep = &s.endpoints[endpoint];
            let refusal = if !ep.flags.contains(EndpointFlags::TRANSMIT) {
                Some(Error::InvalidEndpoint)
            } else if exclusive && ep.tx_head.is_some() {
                Some(Error::Busy)
            } else {
                None
            };
            match refusal {
                Some(e) => {
                    s.release(node);
                    Err(e)
                }
                None => {
                    s.push_tail(endpoint, node);
                    Ok(())
                }
            }
        })
    }

    fn check_transmitter(&self, endpoint: usize) -> Result<(), Error> {
        check_endpoint(endpoint)?;
        if self.with_state(|s| s.endpoints[endpoint].flags.contains(EndpointFlags::TRANSMIT)) {
            Ok(())
        } else {
            Err(Error::InvalidEndpoint)
        }
    }

    fn out_of_memory() -> Error {
        log::warn!("usb: transmit pool exhausted");
        Error::NoMemory
    }

    /// Steps the pump until it arms a packet or runs out of work. A retired
    /// transmission makes room for the next one straight away.
    pub(crate) fn pump_endpoint(&self, endpoint: usize) {
        while let Some(retired) = self.with_state(|s| self.pump_locked(s, endpoint)) {
            if let Some(cb) = retired {
                cb(endpoint, TxStatus::Sent);
            }
        }
    }

    /// One step of the pump. Returns `Some` with the retired transmission's
    /// callback if it retired one, for the caller to run once the lock is
    /// released.
    fn pump_locked(&self, s: &mut State<H>, endpoint: usize) -> Option<Option<Completion>> {
        let table = self.hardware().table();
        let ep = s.endpoints[endpoint];
        let id = ep.tx_head?;

        // The controller consumes the slots strictly in turn, so the only one
        // worth looking at is the one it will get to next.
        let slot = table.slot(endpoint, Direction::Tx, ep.tx_bank);
        if slot.owner() == Owner::Hardware {
            return None;
        }

        let node = *s.nodes.get(id);
        if node.len != 0 && node.cursor == node.len {
            // Everything is armed; hold on to the buffer until the last
            // packet has actually gone out.
            if let Some(bank) = node.last_bank {
                if table.slot(endpoint, Direction::Tx, bank).owner() == Owner::Hardware {
                    return None;
                }
            }
            return s.retire_head(endpoint).map(|n| n.callback);
        }

        let chunk = node
            .remaining()
            .min(usize::from(ep.max_packet_size))
            .min(MAX_BYTE_COUNT);
        let buffer = match node.payload {
            Payload::Empty => ptr::null_mut(),
            Payload::Static(data) => data.as_ptr().wrapping_add(node.cursor) as *mut u8,
            Payload::Owned { first, .. } => self.tx_block(first).wrapping_add(node.cursor),
        };
        log::trace!(
            "usb: ep{} tx {} bytes {:?} {:?}",
            endpoint,
            chunk,
            ep.tx_bank,
            ep.tx_toggle
        );
        // Safety: the payload belongs to this node until it's retired, and
        // retirement waits for this slot to come back (see above).
        unsafe { slot.arm(buffer, chunk, ep.tx_toggle) };

        let n = s.nodes.get_mut(id);
        n.cursor += chunk;
        n.last_bank = Some(ep.tx_bank);
        let e = &mut s.endpoints[endpoint];
        e.tx_toggle.flip();
        e.tx_bank.flip();

        if node.len == 0 {
            // One empty packet is the whole transmission.
            return s.retire_head(endpoint).map(|n| n.callback);
        }
        None
    }

    /// Unlinks and frees `endpoint`'s whole queue.
    pub(crate) fn cancel_queue(&self, s: &mut State<H>, endpoint: usize) -> Cancelled {
        let mut cancelled = Cancelled::none(endpoint);
        while let Some(node) = s.retire_head(endpoint) {
            cancelled.push(node.callback);
        }
        cancelled
    }

    /// Takes back both transmit slots of `endpoint`. The controller must not
    /// be looking at them: the endpoint is disabled, or token processing is
    /// suspended after a SETUP.
    ///
    /// Anything taken back was never sent, so the slot parity and data
    /// toggle wind back to where the controller expects them.
    pub(crate) fn reclaim_transmit_slots(&self, s: &mut State<H>, endpoint: usize) {
        let table = self.hardware().table();
        let ep = &mut s.endpoints[endpoint];
        let mut older = ep.tx_bank;
        older.flip();
        let next = table.slot(endpoint, Direction::Tx, ep.tx_bank);
        let last = table.slot(endpoint, Direction::Tx, older);

        let unsent = [next, last]
            .iter()
            .filter(|slot| slot.owner() == Owner::Hardware)
            .count();
        // With one packet outstanding it's in the slot armed last; with two
        // the controller's pointer is already back where ours is.
        if unsent == 1 {
            ep.tx_bank = older;
        }
        if unsent % 2 == 1 {
            ep.tx_toggle.flip();
        }
        next.reclaim();
        last.reclaim();
    }
}
