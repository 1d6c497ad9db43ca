//! Collaborator seams: the bus driver, the cycle clock and the status sink
//! are injected so the fabric can run against real hardware drivers, the
//! remote-master server, or test doubles.

use crate::frame::CanFdFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Byte-level transmit side of a physical or virtual CAN channel.
pub trait BusTx: Send {
    /// Hand a frame to the driver's transmit queue. `false` means the driver
    /// would not accept it right now; the relay stops draining that ring and
    /// retries on the next cycle.
    fn queue_write(&mut self, frame: &CanFdFrame) -> bool;
}

/// Monotonic simulation cycle counter.
pub trait CycleClock: Send + Sync {
    fn cycle(&self) -> u64;
    /// Nominal wall time of one cycle.
    fn period(&self) -> Duration;
}

/// Write-only publication point for the fault-injection status flag.
pub trait StatusSink: Send + Sync {
    fn publish_fault_active(&self, active: bool);
}

/// A cycle clock advanced explicitly by the scheduler loop.
pub struct SimClock {
    cycle: AtomicU64,
    period: Duration,
}

impl SimClock {
    pub fn new(period: Duration) -> Self {
        Self {
            cycle: AtomicU64::new(0),
            period,
        }
    }

    pub fn advance(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl CycleClock for SimClock {
    fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    fn period(&self) -> Duration {
        self.period
    }
}

/// Discards status updates; for deployments without a monitoring surface.
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn publish_fault_active(&self, _active: bool) {}
}
