// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity pools backing transmissions and receive buffers.
//!
//! These only track *which* pieces are in use. The memory itself lives in the
//! device's buffer arenas, outside the critical section, so that copying
//! into a freshly allocated block doesn't need the lock.

use crate::bdt::Bank;
use crate::config::{RX_PAIRS, TX_BLOCKS, TX_NODES};
use crate::device::Completion;

/// Index of a node in the node pool.
pub(crate) type NodeId = u8;

/// Where a transmission's bytes live.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Payload {
    /// Zero-length packet; no buffer at all.
    Empty,
    /// Borrowed, never released.
    Static(&'static [u8]),
    /// Copied into `blocks` contiguous transmit blocks starting at `first`,
    /// released when the node is.
    Owned { first: u8, blocks: u8 },
}

/// A queued transmission.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TxNode {
    pub len: usize,
    /// Bytes handed to the controller so far.
    pub cursor: usize,
    pub payload: Payload,
    pub callback: Option<Completion>,
    /// Slot holding this node's most recent packet, if any has been armed.
    pub last_bank: Option<Bank>,
    /// Next node in the endpoint queue, or in the free list.
    pub next: Option<NodeId>,
}

impl TxNode {
    pub const EMPTY: Self = Self {
        len: 0,
        cursor: 0,
        payload: Payload::Empty,
        callback: None,
        last_bank: None,
        next: None,
    };

    pub fn new(payload: Payload, len: usize, callback: Option<Completion>) -> Self {
        Self {
            len,
            payload,
            callback,
            ..Self::EMPTY
        }
    }

    pub fn remaining(&self) -> usize {
        self.len - self.cursor
    }
}

/// Transmission nodes, with an intrusive free list threaded through `next`.
pub(crate) struct NodePool {
    nodes: [TxNode; TX_NODES],
    free: Option<NodeId>,
    /// Nodes at or above this index have never been handed out. Saves
    /// building the free list at construction time, which `const fn` can't
    /// loop to do.
    fresh: usize,
}

impl NodePool {
    pub const fn new() -> Self {
        Self {
            nodes: [TxNode::EMPTY; TX_NODES],
            free: None,
            fresh: 0,
        }
    }

    pub fn alloc(&mut self, node: TxNode) -> Option<NodeId> {
        let id = match self.free {
            Some(id) => {
                self.free = self.nodes[usize::from(id)].next;
                id
            }
            None if self.fresh < TX_NODES => {
                self.fresh += 1;
                (self.fresh - 1) as NodeId
            }
            None => return None,
        };
        self.nodes[usize::from(id)] = TxNode { next: None, ..node };
        Some(id)
    }

    /// Returns the node's final contents.
    pub fn free(&mut self, id: NodeId) -> TxNode {
        let node = self.nodes[usize::from(id)];
        self.nodes[usize::from(id)] = TxNode {
            next: self.free,
            ..TxNode::EMPTY
        };
        self.free = Some(id);
        node
    }

    pub fn get(&self, id: NodeId) -> &TxNode {
        &self.nodes[usize::from(id)]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut TxNode {
        &mut self.nodes[usize::from(id)]
    }
}

/// Transmit blocks, one bit each.
pub(crate) struct BlockPool {
    used: u64,
}

impl BlockPool {
    pub const fn new() -> Self {
        Self { used: 0 }
    }

    const fn run(count: usize) -> u64 {
        if count >= 64 {
            u64::MAX
        } else {
            (1 << count) - 1
        }
    }

    /// First fit: takes the lowest run of `count` free blocks.
    pub fn alloc(&mut self, count: usize) -> Option<u8> {
        if count == 0 || count > TX_BLOCKS {
            return None;
        }
        let run = Self::run(count);
        let first = (0..=TX_BLOCKS - count).find(|&i| self.used & run << i == 0)?;
        self.used |= run << first;
        Some(first as u8)
    }

    pub fn free(&mut self, first: u8, count: u8) {
        let mask = Self::run(usize::from(count)) << first;
        debug_assert_eq!(self.used & mask, mask, "freeing unallocated blocks");
        self.used &= !mask;
    }

    #[cfg(test)]
    pub fn in_use(&self) -> u32 {
        self.used.count_ones()
    }
}

/// Receive buffer pairs, one bit each.
pub(crate) struct PairPool {
    used: u16,
}

impl PairPool {
    pub const fn new() -> Self {
        Self { used: 0 }
    }

    pub fn alloc(&mut self) -> Option<u8> {
        let free = (0..RX_PAIRS).find(|&i| self.used & 1 << i == 0)?;
        self.used |= 1 << free;
        Some(free as u8)
    }

    pub fn free(&mut self, pair: u8) {
        debug_assert!(self.used & 1 << pair != 0, "freeing unallocated pair");
        self.used &= !(1 << pair);
    }

    #[cfg(test)]
    pub fn in_use(&self) -> u32 {
        self.used.count_ones()
    }
}
