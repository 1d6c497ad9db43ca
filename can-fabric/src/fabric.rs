use crate::filter::AcceptRule;
use crate::frame::{CanFdFrame, CanFrame, FabricFrame, FrameOrigin};
use crate::inject::{CrossingVerdict, ErrorInjector, FaultRequest};
use crate::registry::{
    DeliverOutcome, FifoHandle, FifoRegistry, FlushMask, OverflowPolicy, WriteOutcome,
    MAX_FIFO_NODES,
};
use crate::seams::{BusTx, CycleClock, StatusSink};
use crate::FabricError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Sleep granularity of the overflow wait policies.
const OVERFLOW_TICK: Duration = Duration::from_millis(10);

/// The complete fabric operation surface.
///
/// Implemented by [`Fabric`] for in-process use and by the remote proxy in
/// `can-fabric-remote`; call sites cannot tell the two apart.
pub trait FabricOps {
    fn create_fifo(
        &self,
        depth: usize,
        fd: bool,
        policy: OverflowPolicy,
    ) -> Result<FifoHandle, FabricError>;
    fn delete_fifo(&self, handle: FifoHandle) -> Result<(), FabricError>;
    fn set_accept_filter(
        &self,
        handle: FifoHandle,
        rules: &[AcceptRule],
    ) -> Result<(), FabricError>;
    fn flush(&self, handle: FifoHandle, mask: FlushMask) -> Result<(), FabricError>;

    fn read_frame(&self, handle: FifoHandle) -> Result<Option<CanFrame>, FabricError>;
    fn read_frames(&self, handle: FifoHandle, max: usize) -> Result<Vec<CanFrame>, FabricError>;
    fn write_frame(&self, handle: FifoHandle, frame: &CanFrame) -> Result<(), FabricError>;
    fn write_frames(&self, handle: FifoHandle, frames: &[CanFrame]) -> Result<usize, FabricError>;

    fn read_fd_frame(&self, handle: FifoHandle) -> Result<Option<CanFdFrame>, FabricError>;
    fn read_fd_frames(
        &self,
        handle: FifoHandle,
        max: usize,
    ) -> Result<Vec<CanFdFrame>, FabricError>;
    fn write_fd_frame(&self, handle: FifoHandle, frame: &CanFdFrame) -> Result<(), FabricError>;
    fn write_fd_frames(
        &self,
        handle: FifoHandle,
        frames: &[CanFdFrame],
    ) -> Result<usize, FabricError>;

    fn install_fault(&self, req: &FaultRequest) -> Result<(), FabricError>;
    fn reset_fault(&self) -> Result<(), FabricError>;

    /// Liveness probe; echoes `value`.
    fn ping(&self, value: u32) -> Result<u32, FabricError>;
}

/// The in-process fabric: node table, fault injector, relay statistics.
pub struct Fabric {
    registry: Mutex<FifoRegistry>,
    injector: ErrorInjector,
    clock: Arc<dyn CycleClock>,
    status: Arc<dyn StatusSink>,
    truncated_relays: AtomicU64,
}

impl Fabric {
    pub fn new(clock: Arc<dyn CycleClock>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            registry: Mutex::new(FifoRegistry::new()),
            injector: ErrorInjector::new(),
            clock,
            status,
            truncated_relays: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> &Arc<dyn CycleClock> {
        &self.clock
    }

    pub fn live_nodes(&self) -> usize {
        self.registry().live_nodes()
    }

    /// How many relayed FD frames lost payload bytes when looped back into a
    /// classic node.
    pub fn truncated_relays(&self) -> u64 {
        self.truncated_relays.load(Ordering::Relaxed)
    }

    /// Fan a bus-side frame out to every node whose filter accepts it.
    /// Returns the number of nodes that received it.
    pub fn write_from_bus(&self, frame: &CanFdFrame) -> usize {
        let now = self.clock.cycle();
        let mut frame = *frame;
        frame.set_origin(FrameOrigin::Received);
        if self.injector.apply(&mut frame, now, &*self.status) == CrossingVerdict::Suppress {
            return 0;
        }

        let candidates = self
            .registry()
            .bus_candidates(frame.channel(), frame.id_raw());
        let mut delivered = 0;
        for slot in candidates {
            let Some(policy) = self.registry().slot_policy(slot) else {
                continue;
            };
            let mut budget = policy.wait_budget();
            loop {
                let force = budget == Some(0);
                match self.registry().deliver_rx(slot, &frame, force) {
                    DeliverOutcome::Written => {
                        delivered += 1;
                        break;
                    }
                    DeliverOutcome::Rejected => break,
                    DeliverOutcome::Full => {}
                }
                if let Some(remaining) = &mut budget {
                    *remaining -= 1;
                }
                thread::sleep(OVERFLOW_TICK);
            }
        }
        delivered
    }

    /// Drain every node's transmit ring for `channel` onto the bus, looping
    /// each accepted frame back into the other nodes' receive rings. A
    /// refused bus write leaves the frame queued for the next cycle.
    pub fn relay_channel(&self, channel: u8, bus: &mut dyn BusTx) -> usize {
        let mut relayed = 0;
        for slot in 0..MAX_FIFO_NODES {
            loop {
                let Some(mut frame) = self.registry().peek_tx(slot, channel) else {
                    break;
                };
                let now = self.clock.cycle();
                if self.injector.apply(&mut frame, now, &*self.status)
                    == CrossingVerdict::Suppress
                {
                    self.registry().consume_tx(slot, channel);
                    continue;
                }
                if !bus.queue_write(&frame) {
                    break;
                }
                let mut reg = self.registry();
                reg.consume_tx(slot, channel);
                frame.set_origin(FrameOrigin::SelfTransmitted);
                frame.set_timestamp(now);
                let truncated = reg.loopback(slot, &frame);
                drop(reg);
                if truncated > 0 {
                    self.truncated_relays.fetch_add(truncated, Ordering::Relaxed);
                }
                relayed += 1;
            }
        }
        relayed
    }

    fn registry(&self) -> MutexGuard<'_, FifoRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One write attempt per tick; `force` becomes true once the policy's
    /// wait budget is spent, turning the write into drop-oldest.
    fn write_with_policy(
        &self,
        handle: FifoHandle,
        mut attempt: impl FnMut(&mut FifoRegistry, bool) -> Result<WriteOutcome, FabricError>,
    ) -> Result<(), FabricError> {
        let policy = self.registry().policy(handle)?;
        let mut budget = policy.wait_budget();
        loop {
            let force = budget == Some(0);
            {
                let mut reg = self.registry();
                match attempt(&mut reg, force)? {
                    WriteOutcome::Written => return Ok(()),
                    WriteOutcome::Full => {}
                }
            }
            if let Some(remaining) = &mut budget {
                *remaining -= 1;
            }
            thread::sleep(OVERFLOW_TICK);
        }
    }
}

impl FabricOps for Fabric {
    fn create_fifo(
        &self,
        depth: usize,
        fd: bool,
        policy: OverflowPolicy,
    ) -> Result<FifoHandle, FabricError> {
        self.registry().create(depth, fd, policy)
    }

    fn delete_fifo(&self, handle: FifoHandle) -> Result<(), FabricError> {
        self.registry().delete(handle)
    }

    fn set_accept_filter(
        &self,
        handle: FifoHandle,
        rules: &[AcceptRule],
    ) -> Result<(), FabricError> {
        self.registry().set_filter(handle, rules)
    }

    fn flush(&self, handle: FifoHandle, mask: FlushMask) -> Result<(), FabricError> {
        self.registry().flush(handle, mask)
    }

    fn read_frame(&self, handle: FifoHandle) -> Result<Option<CanFrame>, FabricError> {
        self.registry().read_classic(handle)
    }

    fn read_frames(&self, handle: FifoHandle, max: usize) -> Result<Vec<CanFrame>, FabricError> {
        self.registry().read_classic_many(handle, max)
    }

    fn write_frame(&self, handle: FifoHandle, frame: &CanFrame) -> Result<(), FabricError> {
        self.write_with_policy(handle, |reg, force| reg.write_classic(handle, frame, force))
    }

    fn write_frames(&self, handle: FifoHandle, frames: &[CanFrame]) -> Result<usize, FabricError> {
        for frame in frames {
            self.write_frame(handle, frame)?;
        }
        Ok(frames.len())
    }

    fn read_fd_frame(&self, handle: FifoHandle) -> Result<Option<CanFdFrame>, FabricError> {
        self.registry().read_fd(handle)
    }

    fn read_fd_frames(
        &self,
        handle: FifoHandle,
        max: usize,
    ) -> Result<Vec<CanFdFrame>, FabricError> {
        self.registry().read_fd_many(handle, max)
    }

    fn write_fd_frame(&self, handle: FifoHandle, frame: &CanFdFrame) -> Result<(), FabricError> {
        self.write_with_policy(handle, |reg, force| reg.write_fd(handle, frame, force))
    }

    fn write_fd_frames(
        &self,
        handle: FifoHandle,
        frames: &[CanFdFrame],
    ) -> Result<usize, FabricError> {
        for frame in frames {
            self.write_fd_frame(handle, frame)?;
        }
        Ok(frames.len())
    }

    fn install_fault(&self, req: &FaultRequest) -> Result<(), FabricError> {
        self.injector
            .install(req, self.clock.cycle(), &*self.status);
        Ok(())
    }

    fn reset_fault(&self) -> Result<(), FabricError> {
        self.injector.reset(&*self.status);
        Ok(())
    }

    fn ping(&self, value: u32) -> Result<u32, FabricError> {
        Ok(value)
    }
}
