// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors surfaced to callers of the upward API.
//!
//! Host misbehavior is not in here. An unsupported or malformed request is
//! answered with a STALL on the wire and never reaches the caller.

/// Things that can go wrong when asking the device to do something.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The endpoint number is out of range, or the endpoint is not enabled
    /// for the requested direction.
    #[error("invalid endpoint")]
    InvalidEndpoint,
    /// Max packet size must be between 1 and 64 bytes.
    #[error("max packet size out of range")]
    InvalidPacketSize,
    /// One of the fixed pools is exhausted. Nothing was queued.
    #[error("out of buffer memory")]
    NoMemory,
    /// `try_send` found a transmission already queued on the endpoint.
    #[error("endpoint busy")]
    Busy,
}
