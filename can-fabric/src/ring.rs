//! Fixed-capacity frame rings.
//!
//! A ring never reallocates after construction. Each slot carries an
//! `occupied` flag which is the only empty/full signal; the read and write
//! cursors chase each other modulo the depth. Writers decide between
//! dropping the oldest entry and refusing the new one; that policy lives in
//! the registry, not here.

use crate::frame::FabricFrame;

struct Slot<F> {
    frame: F,
    occupied: bool,
}

pub struct RingQueue<F> {
    slots: Box<[Slot<F>]>,
    read: usize,
    write: usize,
    count: usize,
}

impl<F: FabricFrame> RingQueue<F> {
    /// Allocate a ring of `depth` slots. Depth zero is rounded up to one.
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        let mut slots = Vec::with_capacity(depth);
        for _ in 0..depth {
            slots.push(Slot {
                frame: F::default(),
                occupied: false,
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            read: 0,
            write: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Full when the slot under the write cursor still holds an unread frame.
    pub fn is_full(&self) -> bool {
        self.slots[self.write].occupied
    }

    /// Enqueue without displacing anything. Fails when full.
    pub fn try_enqueue(&mut self, frame: F) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.write].frame = frame;
        self.slots[self.write].occupied = true;
        self.write = (self.write + 1) % self.slots.len();
        self.count += 1;
        true
    }

    /// Enqueue, overwriting the oldest unread frame when full. Returns true
    /// when a frame was displaced.
    pub fn enqueue_drop_oldest(&mut self, frame: F) -> bool {
        let mut dropped = false;
        if self.is_full() {
            self.slots[self.read].occupied = false;
            self.read = (self.read + 1) % self.slots.len();
            self.count -= 1;
            dropped = true;
        }
        let ok = self.try_enqueue(frame);
        debug_assert!(ok);
        dropped
    }

    /// Look at the oldest unread frame without consuming it.
    pub fn peek(&self) -> Option<&F> {
        if self.slots[self.read].occupied {
            Some(&self.slots[self.read].frame)
        } else {
            None
        }
    }

    pub fn dequeue(&mut self) -> Option<F> {
        if !self.slots[self.read].occupied {
            return None;
        }
        let frame = self.slots[self.read].frame;
        self.slots[self.read].occupied = false;
        self.read = (self.read + 1) % self.slots.len();
        self.count -= 1;
        Some(frame)
    }

    /// Drop every unread frame, keeping the cursors where they are.
    pub fn clear(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CanFrame, FrameOrigin};

    fn frame(id: u16) -> CanFrame {
        CanFrame::from_raw(id as u32, 0, 0, &[id as u8], 0, FrameOrigin::Received).unwrap()
    }

    #[test]
    fn fifo_order() {
        let mut ring = RingQueue::new(4);
        for id in 1..=3 {
            assert!(ring.try_enqueue(frame(id)));
        }
        assert_eq!(ring.len(), 3);
        for id in 1..=3u16 {
            assert_eq!(ring.dequeue().unwrap().id_raw(), id as u32);
        }
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn refuses_when_full() {
        let mut ring = RingQueue::new(2);
        assert!(ring.try_enqueue(frame(1)));
        assert!(ring.try_enqueue(frame(2)));
        assert!(ring.is_full());
        assert!(!ring.try_enqueue(frame(3)));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn drop_oldest_keeps_newest_in_order() {
        let mut ring = RingQueue::new(4);
        for id in 1..=5 {
            ring.enqueue_drop_oldest(frame(id));
        }
        let mut out = Vec::new();
        while let Some(f) = ring.dequeue() {
            out.push(f.id_raw());
        }
        assert_eq!(out, vec![2, 3, 4, 5]);
    }

    #[test]
    fn survives_wraparound() {
        let mut ring = RingQueue::new(3);
        for round in 0..10u16 {
            assert!(ring.try_enqueue(frame(round + 1)));
            assert_eq!(ring.dequeue().unwrap().id_raw(), (round + 1) as u32);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn clear_empties_without_reset() {
        let mut ring = RingQueue::new(3);
        ring.try_enqueue(frame(1));
        ring.try_enqueue(frame(2));
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.try_enqueue(frame(7)));
        assert_eq!(ring.dequeue().unwrap().id_raw(), 7);
    }

    #[test]
    fn zero_depth_rounds_up_to_one_slot() {
        let mut ring = RingQueue::<CanFrame>::new(0);
        assert!(ring.try_enqueue(frame(1)));
        assert!(!ring.try_enqueue(frame(2)));
        assert_eq!(ring.dequeue().unwrap().id_raw(), 1);
        assert!(ring.is_empty());
    }
}
