//! A virtual CAN bus fabric for hardware-in-the-loop simulation.
//!
//! Simulated ECUs attach to the fabric by creating fifo nodes. Each node owns
//! one receive ring plus one transmit ring per channel, an optional accept
//! filter, and an overflow policy. Frames entering from the bus side fan out
//! to every accepting node; frames queued by a node are relayed onto the bus
//! and looped back into the other nodes' receive rings. A single fault
//! injector can corrupt, resize, or suppress frames at the bus crossing for a
//! bounded number of cycles.
//!
//! All fabric state is owned by a [`Fabric`] value; there are no process-wide
//! statics. The remote transport in the `can-fabric-remote` crate drives the
//! same operations over TCP.

mod fabric;
mod filter;
mod frame;
mod inject;
mod registry;
mod ring;
mod seams;

pub use fabric::{Fabric, FabricOps};
pub use filter::{AcceptFilter, AcceptRule};
pub use frame::{
    CanFdFrame, CanFrame, FabricFrame, FrameOrigin, FLAG_BRS, FLAG_EXTENDED, FLAG_FDF,
};
pub use inject::{CrossingVerdict, ErrorInjector, FaultAction, FaultRequest};
pub use registry::{
    FifoHandle, FifoRegistry, FlushMask, OverflowPolicy, DEFAULT_FIFO_DEPTH, MAX_CHANNELS,
    MAX_FIFO_NODES,
};
pub use seams::{BusTx, CycleClock, NullStatusSink, SimClock, StatusSink};

use std::error::Error;
use std::fmt;

/// Error type shared by every fabric operation, local or remote.
///
/// The variants map onto the integer sentinels carried on the wire so that a
/// remote call fails exactly the way the same local call would.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    /// The handle does not name a live fifo node (never created, deleted, or
    /// from an earlier generation of the same slot).
    InvalidHandle,
    /// All fifo node slots are occupied.
    NoFreeSlot,
    /// Ring storage could not be allocated.
    OutOfMemory,
    /// The remote transport failed (connection refused, reset, short reply).
    Transport,
}

impl FabricError {
    /// Integer sentinel carried in acknowledgement messages.
    pub fn to_ret(self) -> i32 {
        match self {
            FabricError::InvalidHandle => -1,
            FabricError::NoFreeSlot => -2,
            FabricError::OutOfMemory => -3,
            FabricError::Transport => -1,
        }
    }

    /// Inverse of [`to_ret`](Self::to_ret) for negative acknowledgement values.
    pub fn from_ret(ret: i32) -> Option<Self> {
        match ret {
            -1 => Some(FabricError::InvalidHandle),
            -2 => Some(FabricError::NoFreeSlot),
            -3 => Some(FabricError::OutOfMemory),
            r if r < 0 => Some(FabricError::Transport),
            _ => None,
        }
    }
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricError::InvalidHandle => write!(f, "invalid or stale fifo handle"),
            FabricError::NoFreeSlot => write!(f, "no free fifo node slot"),
            FabricError::OutOfMemory => write!(f, "fifo storage exhausted"),
            FabricError::Transport => write!(f, "remote transport failure"),
        }
    }
}

impl Error for FabricError {}
