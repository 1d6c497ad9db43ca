//! The fifo node table.
//!
//! At most [`MAX_FIFO_NODES`] nodes are live at once. Slots are stable: a
//! deleted node leaves a hole, and the 16-bit generation counter folded into
//! every handle makes handles from earlier occupants of the same slot
//! detectably stale.
//!
//! Everything here runs under the fabric's registry mutex. Waiting on a full
//! ring (release the lock, sleep a tick, retry) is orchestrated by the
//! [`Fabric`](crate::Fabric), which is why the write paths take a `force`
//! flag instead of sleeping themselves.

use crate::filter::{AcceptFilter, AcceptRule};
use crate::frame::{CanFdFrame, CanFrame, FabricFrame};
use crate::ring::RingQueue;
use crate::FabricError;

/// Upper bound on simultaneously live fifo nodes.
pub const MAX_FIFO_NODES: usize = 10;
/// Number of CAN channels the fabric multiplexes.
pub const MAX_CHANNELS: usize = 8;
/// Ring depth used when a caller passes zero.
pub const DEFAULT_FIFO_DEPTH: usize = 64;

/// What a node does when a frame arrives and its target ring is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Overwrite the oldest unread frame.
    DropOldest,
    /// Release the lock and retry for up to this many 10 ms ticks, then
    /// fall back to dropping the oldest frame.
    WaitTicks(u16),
    /// Retry until space appears.
    BlockForever,
}

impl OverflowPolicy {
    /// Wire encoding: 0 drop-oldest, 1..=32767 wait ticks, negative block.
    pub fn to_raw(self) -> i32 {
        match self {
            OverflowPolicy::DropOldest => 0,
            OverflowPolicy::WaitTicks(ticks) => ticks as i32,
            OverflowPolicy::BlockForever => -1,
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        if raw < 0 {
            OverflowPolicy::BlockForever
        } else if raw == 0 {
            OverflowPolicy::DropOldest
        } else {
            OverflowPolicy::WaitTicks(raw.min(32767) as u16)
        }
    }

    /// Remaining retry budget; `None` means unbounded.
    pub(crate) fn wait_budget(self) -> Option<u32> {
        match self {
            OverflowPolicy::DropOldest => Some(0),
            OverflowPolicy::WaitTicks(ticks) => Some(ticks as u32),
            OverflowPolicy::BlockForever => None,
        }
    }
}

/// Which rings [`FifoRegistry::flush`] empties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushMask(u32);

impl FlushMask {
    pub const RX: FlushMask = FlushMask(0x1);
    pub const TX: FlushMask = FlushMask(0x2);
    pub const ALL: FlushMask = FlushMask(0x3);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        FlushMask(bits & Self::ALL.0)
    }

    pub fn contains(self, other: FlushMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FlushMask {
    type Output = FlushMask;

    fn bitor(self, rhs: FlushMask) -> FlushMask {
        FlushMask(self.0 | rhs.0)
    }
}

/// Opaque fifo node handle: slot index in the low 8 bits, the creating
/// generation in bits 8..24.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FifoHandle(i32);

impl FifoHandle {
    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn from_raw(raw: i32) -> Self {
        FifoHandle(raw)
    }

    fn slot(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    fn new(generation: u16, slot: usize) -> Self {
        FifoHandle(((generation as i32) << 8) | slot as i32)
    }
}

/// Outcome of a single non-sleeping write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Written,
    /// Ring full and the caller did not force; nothing changed.
    Full,
}

/// Outcome of delivering a bus frame into one node's receive ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeliverOutcome {
    Written,
    Full,
    /// Classic node cannot take a payload longer than 8 bytes.
    Rejected,
}

struct NodeRings<F: FabricFrame> {
    rx: RingQueue<F>,
    tx: Vec<RingQueue<F>>,
}

impl<F: FabricFrame> NodeRings<F> {
    fn new(depth: usize) -> Self {
        Self {
            rx: RingQueue::new(depth),
            tx: (0..MAX_CHANNELS).map(|_| RingQueue::new(depth)).collect(),
        }
    }
}

enum NodeQueues {
    Classic(NodeRings<CanFrame>),
    Fd(NodeRings<CanFdFrame>),
}

struct FifoNode {
    handle: FifoHandle,
    queues: NodeQueues,
    filter: Option<AcceptFilter>,
    policy: OverflowPolicy,
}

/// The node table. All access happens under one external mutex.
pub struct FifoRegistry {
    nodes: [Option<FifoNode>; MAX_FIFO_NODES],
    next_generation: u16,
}

impl Default for FifoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoRegistry {
    pub fn new() -> Self {
        Self {
            nodes: Default::default(),
            next_generation: 1,
        }
    }

    pub fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_some()).count()
    }

    pub fn create(
        &mut self,
        depth: usize,
        fd: bool,
        policy: OverflowPolicy,
    ) -> Result<FifoHandle, FabricError> {
        let depth = if depth == 0 { DEFAULT_FIFO_DEPTH } else { depth };
        let slot = self
            .nodes
            .iter()
            .position(|node| node.is_none())
            .ok_or(FabricError::NoFreeSlot)?;
        let handle = FifoHandle::new(self.next_generation, slot);
        self.next_generation = self.next_generation.wrapping_add(1);
        let queues = if fd {
            NodeQueues::Fd(NodeRings::new(depth))
        } else {
            NodeQueues::Classic(NodeRings::new(depth))
        };
        self.nodes[slot] = Some(FifoNode {
            handle,
            queues,
            filter: None,
            policy,
        });
        Ok(handle)
    }

    pub fn delete(&mut self, handle: FifoHandle) -> Result<(), FabricError> {
        let slot = self.checked_slot(handle)?;
        self.nodes[slot] = None;
        Ok(())
    }

    pub fn set_filter(
        &mut self,
        handle: FifoHandle,
        rules: &[AcceptRule],
    ) -> Result<(), FabricError> {
        let node = self.node_mut(handle)?;
        // Build the replacement first, then swap; readers under the same
        // lock never observe a half-written list.
        let fresh = AcceptFilter::new(rules);
        node.filter = Some(fresh);
        Ok(())
    }

    pub fn flush(&mut self, handle: FifoHandle, mask: FlushMask) -> Result<(), FabricError> {
        let node = self.node_mut(handle)?;
        match &mut node.queues {
            NodeQueues::Classic(rings) => flush_rings(rings, mask),
            NodeQueues::Fd(rings) => flush_rings(rings, mask),
        }
        Ok(())
    }

    pub fn policy(&self, handle: FifoHandle) -> Result<OverflowPolicy, FabricError> {
        Ok(self.node(handle)?.policy)
    }

    pub fn read_classic(&mut self, handle: FifoHandle) -> Result<Option<CanFrame>, FabricError> {
        match &mut self.node_mut(handle)?.queues {
            NodeQueues::Classic(rings) => Ok(rings.rx.dequeue()),
            NodeQueues::Fd(_) => Err(FabricError::InvalidHandle),
        }
    }

    pub fn read_classic_many(
        &mut self,
        handle: FifoHandle,
        max: usize,
    ) -> Result<Vec<CanFrame>, FabricError> {
        match &mut self.node_mut(handle)?.queues {
            NodeQueues::Classic(rings) => Ok(drain_up_to(&mut rings.rx, max)),
            NodeQueues::Fd(_) => Err(FabricError::InvalidHandle),
        }
    }

    pub fn read_fd(&mut self, handle: FifoHandle) -> Result<Option<CanFdFrame>, FabricError> {
        match &mut self.node_mut(handle)?.queues {
            NodeQueues::Fd(rings) => Ok(rings.rx.dequeue()),
            NodeQueues::Classic(_) => Err(FabricError::InvalidHandle),
        }
    }

    pub fn read_fd_many(
        &mut self,
        handle: FifoHandle,
        max: usize,
    ) -> Result<Vec<CanFdFrame>, FabricError> {
        match &mut self.node_mut(handle)?.queues {
            NodeQueues::Fd(rings) => Ok(drain_up_to(&mut rings.rx, max)),
            NodeQueues::Classic(_) => Err(FabricError::InvalidHandle),
        }
    }

    pub(crate) fn write_classic(
        &mut self,
        handle: FifoHandle,
        frame: &CanFrame,
        force: bool,
    ) -> Result<WriteOutcome, FabricError> {
        let channel = frame.channel();
        match &mut self.node_mut(handle)?.queues {
            NodeQueues::Classic(rings) => write_tx(rings, channel, *frame, force),
            NodeQueues::Fd(_) => Err(FabricError::InvalidHandle),
        }
    }

    pub(crate) fn write_fd(
        &mut self,
        handle: FifoHandle,
        frame: &CanFdFrame,
        force: bool,
    ) -> Result<WriteOutcome, FabricError> {
        let channel = frame.channel();
        match &mut self.node_mut(handle)?.queues {
            NodeQueues::Fd(rings) => write_tx(rings, channel, *frame, force),
            NodeQueues::Classic(_) => Err(FabricError::InvalidHandle),
        }
    }

    /// Slots whose filter accepts a frame on `channel` with identifier
    /// `id_raw`. Nodes without a filter accept nothing from the bus.
    pub(crate) fn bus_candidates(&self, channel: u8, id_raw: u32) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| {
                let node = node.as_ref()?;
                let filter = node.filter.as_ref()?;
                filter.accepts(channel, id_raw).then_some(slot)
            })
            .collect()
    }

    pub(crate) fn slot_policy(&self, slot: usize) -> Option<OverflowPolicy> {
        Some(self.nodes.get(slot)?.as_ref()?.policy)
    }

    /// Deliver a bus frame into one node's receive ring, narrowing for
    /// classic nodes.
    pub(crate) fn deliver_rx(
        &mut self,
        slot: usize,
        frame: &CanFdFrame,
        force: bool,
    ) -> DeliverOutcome {
        let Some(Some(node)) = self.nodes.get_mut(slot) else {
            return DeliverOutcome::Rejected;
        };
        match &mut node.queues {
            NodeQueues::Fd(rings) => enqueue_rx(&mut rings.rx, *frame, force),
            NodeQueues::Classic(rings) => {
                if frame.dlc() > CanFrame::MAX_DATA {
                    return DeliverOutcome::Rejected;
                }
                let (classic, _) = CanFrame::from_fd(frame);
                enqueue_rx(&mut rings.rx, classic, force)
            }
        }
    }

    /// Loop a relayed frame back into every other node's receive ring. On a
    /// full ring the frame is skipped for that node, never displacing older
    /// traffic. Returns how many deliveries narrowed the payload.
    pub(crate) fn loopback(&mut self, from_slot: usize, frame: &CanFdFrame) -> u64 {
        let mut truncated = 0;
        for slot in 0..MAX_FIFO_NODES {
            if slot == from_slot {
                continue;
            }
            let Some(Some(node)) = self.nodes.get_mut(slot) else {
                continue;
            };
            let Some(filter) = node.filter.as_ref() else {
                continue;
            };
            if !filter.accepts(frame.channel(), frame.id_raw()) {
                continue;
            }
            match &mut node.queues {
                NodeQueues::Fd(rings) => {
                    rings.rx.try_enqueue(*frame);
                }
                NodeQueues::Classic(rings) => {
                    let (classic, was_cut) = CanFrame::from_fd(frame);
                    if rings.rx.try_enqueue(classic) && was_cut {
                        truncated += 1;
                    }
                }
            }
        }
        truncated
    }

    /// The oldest undelivered transmit frame on `channel` for `slot`, widened
    /// to the FD shape. Consumed separately so a refused bus write leaves the
    /// frame queued.
    pub(crate) fn peek_tx(&self, slot: usize, channel: u8) -> Option<CanFdFrame> {
        let node = self.nodes.get(slot)?.as_ref()?;
        let ch = channel as usize;
        if ch >= MAX_CHANNELS {
            return None;
        }
        match &node.queues {
            NodeQueues::Fd(rings) => rings.tx[ch].peek().copied(),
            NodeQueues::Classic(rings) => rings.tx[ch].peek().map(CanFdFrame::from_classic),
        }
    }

    pub(crate) fn consume_tx(&mut self, slot: usize, channel: u8) {
        let Some(Some(node)) = self.nodes.get_mut(slot) else {
            return;
        };
        let ch = channel as usize;
        if ch >= MAX_CHANNELS {
            return;
        }
        match &mut node.queues {
            NodeQueues::Fd(rings) => {
                rings.tx[ch].dequeue();
            }
            NodeQueues::Classic(rings) => {
                rings.tx[ch].dequeue();
            }
        }
    }

    fn checked_slot(&self, handle: FifoHandle) -> Result<usize, FabricError> {
        let slot = handle.slot();
        match self.nodes.get(slot) {
            Some(Some(node)) if node.handle == handle => Ok(slot),
            _ => Err(FabricError::InvalidHandle),
        }
    }

    fn node(&self, handle: FifoHandle) -> Result<&FifoNode, FabricError> {
        let slot = self.checked_slot(handle)?;
        Ok(self.nodes[slot].as_ref().unwrap_or_else(|| unreachable!()))
    }

    fn node_mut(&mut self, handle: FifoHandle) -> Result<&mut FifoNode, FabricError> {
        let slot = self.checked_slot(handle)?;
        Ok(self.nodes[slot].as_mut().unwrap_or_else(|| unreachable!()))
    }
}

fn flush_rings<F: FabricFrame>(rings: &mut NodeRings<F>, mask: FlushMask) {
    if mask.contains(FlushMask::RX) {
        rings.rx.clear();
    }
    if mask.contains(FlushMask::TX) {
        for ring in &mut rings.tx {
            ring.clear();
        }
    }
}

fn drain_up_to<F: FabricFrame>(ring: &mut RingQueue<F>, max: usize) -> Vec<F> {
    if ring.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(max.min(ring.len()));
    while out.len() < max {
        match ring.dequeue() {
            Some(frame) => out.push(frame),
            None => break,
        }
    }
    out
}

fn write_tx<F: FabricFrame>(
    rings: &mut NodeRings<F>,
    channel: u8,
    frame: F,
    force: bool,
) -> Result<WriteOutcome, FabricError> {
    let ch = channel as usize;
    if ch >= MAX_CHANNELS {
        return Err(FabricError::InvalidHandle);
    }
    let ring = &mut rings.tx[ch];
    if ring.is_full() && !force {
        return Ok(WriteOutcome::Full);
    }
    if force {
        ring.enqueue_drop_oldest(frame);
    } else {
        ring.try_enqueue(frame);
    }
    Ok(WriteOutcome::Written)
}

fn enqueue_rx<F: FabricFrame>(ring: &mut RingQueue<F>, frame: F, force: bool) -> DeliverOutcome {
    if ring.is_full() && !force {
        return DeliverOutcome::Full;
    }
    if force {
        ring.enqueue_drop_oldest(frame);
    } else {
        ring.try_enqueue(frame);
    }
    DeliverOutcome::Written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameOrigin;

    fn classic(id: u32, channel: u8) -> CanFrame {
        CanFrame::from_raw(id, 0, channel, &[0xAB], 0, FrameOrigin::Received).unwrap()
    }

    #[test]
    fn handles_encode_generation_and_slot() {
        let mut reg = FifoRegistry::new();
        let a = reg
            .create(4, false, OverflowPolicy::DropOldest)
            .unwrap();
        reg.delete(a).unwrap();
        let b = reg
            .create(4, false, OverflowPolicy::DropOldest)
            .unwrap();
        // Same slot, different generation.
        assert_eq!(a.raw() & 0xFF, b.raw() & 0xFF);
        assert_ne!(a.raw(), b.raw());
        assert_eq!(reg.read_classic(a), Err(FabricError::InvalidHandle));
        assert!(reg.read_classic(b).unwrap().is_none());
    }

    #[test]
    fn node_table_is_bounded() {
        let mut reg = FifoRegistry::new();
        let handles: Vec<_> = (0..MAX_FIFO_NODES)
            .map(|_| reg.create(2, false, OverflowPolicy::DropOldest).unwrap())
            .collect();
        assert_eq!(
            reg.create(2, false, OverflowPolicy::DropOldest),
            Err(FabricError::NoFreeSlot)
        );
        reg.delete(handles[3]).unwrap();
        assert!(reg.create(2, false, OverflowPolicy::DropOldest).is_ok());
    }

    #[test]
    fn shape_mismatch_is_an_invalid_handle() {
        let mut reg = FifoRegistry::new();
        let fd = reg.create(4, true, OverflowPolicy::DropOldest).unwrap();
        assert_eq!(reg.read_classic(fd), Err(FabricError::InvalidHandle));
        assert_eq!(
            reg.write_classic(fd, &classic(1, 0), true),
            Err(FabricError::InvalidHandle)
        );
        assert!(reg.read_fd(fd).unwrap().is_none());
    }

    #[test]
    fn bus_delivery_honors_filters() {
        let mut reg = FifoRegistry::new();
        let h = reg.create(4, false, OverflowPolicy::DropOldest).unwrap();
        let frame =
            CanFdFrame::from_raw(0x234, 0, 1, &[1], 5, FrameOrigin::Received).unwrap();

        // No filter installed: nothing listens.
        assert!(reg.bus_candidates(1, 0x234).is_empty());

        reg.set_filter(
            h,
            &[AcceptRule {
                channel: 1,
                start_id: 0x200,
                stop_id: 0x2FF,
            }],
        )
        .unwrap();
        assert_eq!(reg.bus_candidates(1, 0x234), vec![0]);
        assert!(reg.bus_candidates(0, 0x234).is_empty());
        assert!(reg.bus_candidates(1, 0x300).is_empty());

        assert_eq!(reg.deliver_rx(0, &frame, false), DeliverOutcome::Written);
        let got = reg.read_classic(h).unwrap().unwrap();
        assert_eq!(got.id_raw(), 0x234);
        assert_eq!(got.timestamp(), 5);
    }

    #[test]
    fn classic_node_rejects_long_bus_frames() {
        let mut reg = FifoRegistry::new();
        let h = reg.create(4, false, OverflowPolicy::DropOldest).unwrap();
        reg.set_filter(
            h,
            &[AcceptRule {
                channel: 0,
                start_id: 0,
                stop_id: u32::MAX,
            }],
        )
        .unwrap();
        let long =
            CanFdFrame::from_raw(0x1, 0, 0, &[0; 16], 0, FrameOrigin::Received).unwrap();
        assert_eq!(reg.deliver_rx(0, &long, false), DeliverOutcome::Rejected);
        assert!(reg.read_classic(h).unwrap().is_none());
    }

    #[test]
    fn flush_mask_selects_rings() {
        let mut reg = FifoRegistry::new();
        let h = reg.create(4, false, OverflowPolicy::DropOldest).unwrap();
        reg.set_filter(
            h,
            &[AcceptRule {
                channel: 0,
                start_id: 0,
                stop_id: u32::MAX,
            }],
        )
        .unwrap();
        let bus = CanFdFrame::from_raw(0x7, 0, 0, &[7], 0, FrameOrigin::Received).unwrap();
        reg.deliver_rx(0, &bus, false);
        reg.write_classic(h, &classic(0x8, 0), true).unwrap();

        reg.flush(h, FlushMask::TX).unwrap();
        assert!(reg.peek_tx(0, 0).is_none());
        assert!(reg.read_classic(h).unwrap().is_some());

        reg.deliver_rx(0, &bus, false);
        reg.flush(h, FlushMask::RX).unwrap();
        assert!(reg.read_classic(h).unwrap().is_none());
    }

    #[test]
    fn peek_then_consume_tx() {
        let mut reg = FifoRegistry::new();
        let h = reg.create(4, false, OverflowPolicy::DropOldest).unwrap();
        reg.write_classic(h, &classic(0x55, 2), true).unwrap();
        let peeked = reg.peek_tx(0, 2).unwrap();
        assert_eq!(peeked.id_raw(), 0x55);
        // Peeking does not consume.
        assert!(reg.peek_tx(0, 2).is_some());
        reg.consume_tx(0, 2);
        assert!(reg.peek_tx(0, 2).is_none());
    }

    #[test]
    fn overflow_policy_raw_mapping() {
        assert_eq!(OverflowPolicy::from_raw(0), OverflowPolicy::DropOldest);
        assert_eq!(OverflowPolicy::from_raw(-1), OverflowPolicy::BlockForever);
        assert_eq!(OverflowPolicy::from_raw(5), OverflowPolicy::WaitTicks(5));
        assert_eq!(OverflowPolicy::WaitTicks(32767).to_raw(), 32767);
        assert_eq!(OverflowPolicy::BlockForever.to_raw(), -1);
    }
}
